//! Pure validation predicates over messages and certificates. These encode
//! the protocol's safety conditions; everything here is synchronous and
//! side-effect free.
use std::collections::HashSet;

use ibft_messages::{Message, MsgType, NodeId, PreparedCertificate, RoundChangeCertificate, View};

use crate::IBFT;

/// Reasons for rejecting a PRE-PREPARE under consideration. None of these
/// abort the height; the round keeps waiting for another proposal or for
/// the timer.
#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    /// Message view differs from the view under consideration.
    #[error("message for view {got:?}, expected {want:?}")]
    ViewMismatch {
        /// View carried by the message.
        got: View,
        /// View under consideration.
        want: View,
    },
    /// Message is not a PRE-PREPARE.
    #[error("message is not a proposal")]
    NotAProposal,
    /// The sender is not the proposer of the view.
    #[error("sender is not the proposer of this view")]
    NotFromProposer,
    /// This node is the proposer of the view; it builds its own proposal and
    /// never accepts one from the network, including its own echoed back.
    #[error("this node is the proposer of this view")]
    SelfIsProposer,
    /// The backend rejected the proposed block.
    #[error("invalid block payload")]
    InvalidBlock,
    /// The carried hash does not match the proposal.
    #[error("proposal hash does not match the proposal")]
    InvalidHash,
    /// A round 0 proposal needs no justification and must not carry one.
    #[error("unexpected round change certificate at round 0")]
    UnexpectedCertificate,
    /// A proposal for a later round must justify itself.
    #[error("missing round change certificate")]
    MissingCertificate,
    /// The round change certificate is malformed.
    #[error("invalid round change certificate: {0}")]
    Certificate(#[from] CertificateError),
}

/// Reasons for rejecting a prepared or round change certificate.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    /// The prepared certificate's proposal message is not a PRE-PREPARE.
    #[error("certificate proposal message is not a proposal")]
    NotAProposal,
    /// The prepared certificate carries no prepare votes at all.
    #[error("certificate has no prepare messages")]
    NoPrepares,
    /// Fewer messages than the quorum requires.
    #[error("not enough messages: got {got}, need {need}")]
    NotEnoughMessages {
        /// Messages present.
        got: usize,
        /// Quorum requirement.
        need: usize,
    },
    /// A message of an unexpected kind.
    #[error("message of unexpected kind")]
    KindMismatch,
    /// Two messages share a sender.
    #[error("duplicate sender")]
    DuplicateSender,
    /// Messages disagree on the proposal hash.
    #[error("proposal hash differs across messages")]
    HashMismatch,
    /// Messages disagree on the round.
    #[error("round differs across messages")]
    RoundMismatch,
    /// The certificate's round does not precede the round it justifies.
    #[error("certificate round {round} is not below {limit}")]
    RoundNotBelowLimit {
        /// Round shared by the certificate messages.
        round: u64,
        /// Exclusive upper bound.
        limit: u64,
    },
    /// A message from a different height.
    #[error("message height {got}, expected {want}")]
    HeightMismatch {
        /// Height carried by the message.
        got: u64,
        /// Height under consideration.
        want: u64,
    },
    /// The certificate's proposal is not from the proposer of its view.
    #[error("certificate proposal is not from the proposer of its view")]
    NotFromProposer,
    /// A prepare vote claims to come from the proposer of its view; the
    /// proposer's vote is the proposal itself.
    #[error("prepare message from the proposer of its view")]
    PrepareFromProposer,
    /// The backend rejected a message's sender.
    #[error("invalid sender")]
    InvalidSender,
    /// A round change message is for a different view than the proposal it
    /// justifies.
    #[error("round change message view differs from the proposal view")]
    ViewMismatch,
}

impl IBFT {
    /// Whether an incoming message is worth buffering: the sender checks out
    /// and the view is the current one or newer. Anything older is stale by
    /// definition and dropped.
    pub(crate) fn is_acceptable_message(&self, message: &Message) -> bool {
        self.backend().is_valid_sender(message) && message.view >= self.state.view()
    }

    /// Validates a PRE-PREPARE for the given view. Checks the proposer, the
    /// block, the hash, and the round change justification (mandatory at
    /// rounds > 0, forbidden at round 0).
    pub(crate) fn validate_proposal(
        &self,
        message: &Message,
        view: View,
    ) -> Result<(), ProposalError> {
        if message.view != view {
            return Err(ProposalError::ViewMismatch {
                got: message.view,
                want: view,
            });
        }
        let Some(pre_prepare) = message.pre_prepare() else {
            return Err(ProposalError::NotAProposal);
        };
        let backend = self.backend();
        if !backend.is_proposer(&message.from, view.height, view.round) {
            return Err(ProposalError::NotFromProposer);
        }
        if backend.is_proposer(&backend.id(), view.height, view.round) {
            return Err(ProposalError::SelfIsProposer);
        }
        if !backend.is_valid_block(&pre_prepare.proposal) {
            return Err(ProposalError::InvalidBlock);
        }
        if !backend.is_valid_proposal_hash(&pre_prepare.proposal, &pre_prepare.proposal_hash) {
            return Err(ProposalError::InvalidHash);
        }

        match (&pre_prepare.certificate, view.round) {
            // The first round of a height justifies itself.
            (None, 0) => Ok(()),
            (Some(certificate), 0) if certificate.is_empty() => Ok(()),
            (_, 0) => Err(ProposalError::UnexpectedCertificate),
            (None, _) => Err(ProposalError::MissingCertificate),
            (Some(certificate), _) => {
                self.validate_round_change_certificate(certificate, view)?;
                Ok(())
            }
        }
    }

    /// Validates a prepared certificate: a PRE-PREPARE plus prepare votes
    /// which together reach quorum, all from distinct senders, all agreeing
    /// on the hash and on a round strictly below `round_limit`, all at
    /// `height`, with the proposal coming from the proposer of its view.
    pub(crate) fn validate_prepared_certificate(
        &self,
        certificate: &PreparedCertificate,
        round_limit: u64,
        height: u64,
    ) -> Result<(), CertificateError> {
        let backend = self.backend();
        let proposal = certificate.proposal_message.as_ref();
        let prepares = &certificate.prepare_messages;

        if proposal.kind() != MsgType::PrePrepare {
            return Err(CertificateError::NotAProposal);
        }
        if prepares.is_empty() {
            return Err(CertificateError::NoPrepares);
        }
        let need = backend.quorum(height);
        if prepares.len() + 1 < need {
            return Err(CertificateError::NotEnoughMessages {
                got: prepares.len() + 1,
                need,
            });
        }
        if prepares.iter().any(|m| m.kind() != MsgType::Prepare) {
            return Err(CertificateError::KindMismatch);
        }

        let mut senders: HashSet<&NodeId> = HashSet::new();
        for message in std::iter::once(proposal).chain(prepares.iter()) {
            if !senders.insert(&message.from) {
                return Err(CertificateError::DuplicateSender);
            }
        }

        let hash = proposal.proposal_hash();
        if prepares.iter().any(|m| m.proposal_hash() != hash) {
            return Err(CertificateError::HashMismatch);
        }

        let round = proposal.view.round;
        if prepares.iter().any(|m| m.view.round != round) {
            return Err(CertificateError::RoundMismatch);
        }
        if round >= round_limit {
            return Err(CertificateError::RoundNotBelowLimit {
                round,
                limit: round_limit,
            });
        }
        if let Some(message) = std::iter::once(proposal)
            .chain(prepares.iter())
            .find(|m| m.view.height != height)
        {
            return Err(CertificateError::HeightMismatch {
                got: message.view.height,
                want: height,
            });
        }

        if !backend.is_proposer(&proposal.from, height, round) {
            return Err(CertificateError::NotFromProposer);
        }
        if !backend.is_valid_sender(proposal) {
            return Err(CertificateError::InvalidSender);
        }
        for prepare in prepares {
            if !backend.is_valid_sender(prepare) {
                return Err(CertificateError::InvalidSender);
            }
            if backend.is_proposer(&prepare.from, height, round) {
                return Err(CertificateError::PrepareFromProposer);
            }
        }
        Ok(())
    }

    /// Validates a round change certificate justifying a proposal at `view`:
    /// a quorum of ROUND-CHANGE messages at exactly that view, from distinct
    /// valid senders, each with a valid embedded prepared certificate (if it
    /// carries one) for a round below `view.round`.
    pub(crate) fn validate_round_change_certificate(
        &self,
        certificate: &RoundChangeCertificate,
        view: View,
    ) -> Result<(), CertificateError> {
        let backend = self.backend();
        let need = backend.quorum(view.height);
        if certificate.len() < need {
            return Err(CertificateError::NotEnoughMessages {
                got: certificate.len(),
                need,
            });
        }

        let mut senders: HashSet<&NodeId> = HashSet::new();
        for message in &certificate.0 {
            let Some(round_change) = message.round_change() else {
                return Err(CertificateError::KindMismatch);
            };
            if message.view != view {
                return Err(CertificateError::ViewMismatch);
            }
            if !senders.insert(&message.from) {
                return Err(CertificateError::DuplicateSender);
            }
            if !backend.is_valid_sender(message) {
                return Err(CertificateError::InvalidSender);
            }
            if let Some(prepared) = &round_change.last_prepared_certificate {
                self.validate_prepared_certificate(prepared, view.round, view.height)?;
            }
        }
        Ok(())
    }

    /// Whether a buffered ROUND-CHANGE message may participate in a round
    /// change certificate for `view`: valid sender, and a valid embedded
    /// prepared certificate if it carries one. Used as the store filter by
    /// the proposer and the future-round watchers.
    pub(crate) fn is_valid_round_change(&self, message: &Message, view: View) -> bool {
        if !self.backend().is_valid_sender(message) {
            return false;
        }
        let Some(round_change) = message.round_change() else {
            return false;
        };
        match &round_change.last_prepared_certificate {
            None => true,
            Some(prepared) => {
                match self.validate_prepared_certificate(prepared, view.round, view.height) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::debug!(
                            from = ?message.from,
                            round = view.round,
                            "ignoring round change with a bad prepared certificate: {err}",
                        );
                        false
                    }
                }
            }
        }
    }
}
