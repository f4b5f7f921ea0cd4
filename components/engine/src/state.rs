//! Per-height state of the consensus engine: the current view, the protocol
//! phase, the accepted proposal and the "last prepared" cache that feeds
//! round change justifications.
use std::{fmt, sync::Mutex};

use ibft_messages::{CommittedSeal, Message, Payload, PayloadHash, PreparedCertificate, View};

/// Phase of the round state machine. Within a round the phases are strictly
/// monotonic: NewRound -> Prepare -> Commit -> Fin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Waiting for (or building) a proposal.
    #[default]
    NewRound,
    /// Proposal accepted; collecting PREPARE votes.
    Prepare,
    /// Quorum of PREPAREs seen; collecting COMMIT votes.
    Commit,
    /// Block inserted; the height is done.
    Fin,
}

impl fmt::Display for Phase {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::NewRound => "new round",
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Fin => "fin",
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    view: View,
    phase: Phase,
    /// The accepted PRE-PREPARE of the current round.
    proposal_message: Option<Message>,
    /// Whether the round engine has started driving the current round.
    round_started: bool,
    /// The block this node last reached the prepare quorum for within the
    /// current height. Retained across rounds, cleared at height boundaries.
    last_prepared_proposal: Option<Payload>,
    /// Certificate proving `last_prepared_proposal` was prepared.
    last_prepared_certificate: Option<PreparedCertificate>,
    /// Committed seals collected from the COMMIT quorum.
    committed_seals: Vec<CommittedSeal>,
}

/// Shared state of one sequence. The sequence engine owns all writes; the
/// round engine and the watchers read it concurrently, so every access goes
/// through the mutex.
#[derive(Debug, Default)]
pub(crate) struct State(Mutex<Inner>);

impl State {
    pub(crate) fn view(&self) -> View {
        self.0.lock().unwrap().view
    }

    pub(crate) fn phase(&self) -> Phase {
        self.0.lock().unwrap().phase
    }

    pub(crate) fn round_started(&self) -> bool {
        self.0.lock().unwrap().round_started
    }

    /// The accepted PRE-PREPARE of the current round.
    pub(crate) fn proposal_message(&self) -> Option<Message> {
        self.0.lock().unwrap().proposal_message.clone()
    }

    /// The block carried by the accepted proposal.
    pub(crate) fn proposal(&self) -> Option<Payload> {
        let inner = self.0.lock().unwrap();
        let pre_prepare = inner.proposal_message.as_ref()?.pre_prepare()?;
        Some(pre_prepare.proposal.clone())
    }

    /// The hash carried by the accepted proposal.
    pub(crate) fn proposal_hash(&self) -> Option<PayloadHash> {
        let inner = self.0.lock().unwrap();
        let pre_prepare = inner.proposal_message.as_ref()?.pre_prepare()?;
        Some(pre_prepare.proposal_hash.clone())
    }

    pub(crate) fn committed_seals(&self) -> Vec<CommittedSeal> {
        self.0.lock().unwrap().committed_seals.clone()
    }

    /// The last prepared block and its certificate, for round change
    /// justifications.
    pub(crate) fn last_prepared(&self) -> (Option<Payload>, Option<PreparedCertificate>) {
        let inner = self.0.lock().unwrap();
        (
            inner.last_prepared_proposal.clone(),
            inner.last_prepared_certificate.clone(),
        )
    }

    /// Full reset at a height boundary. Unlike `set_view`, this also drops
    /// the last prepared cache: prepared certificates never outlive their
    /// height.
    pub(crate) fn reset(&self, height: u64) {
        *self.0.lock().unwrap() = Inner {
            view: View { height, round: 0 },
            ..Inner::default()
        };
    }

    /// Moves to a new view within the height: phase back to NewRound, the
    /// accepted proposal and collected seals are dropped, the last prepared
    /// cache is retained.
    pub(crate) fn set_view(&self, view: View) {
        let mut inner = self.0.lock().unwrap();
        inner.view = view;
        inner.phase = Phase::NewRound;
        inner.proposal_message = None;
        inner.round_started = false;
        inner.committed_seals.clear();
    }

    pub(crate) fn set_round_started(&self, started: bool) {
        self.0.lock().unwrap().round_started = started;
    }

    /// Records an accepted PRE-PREPARE and enters the prepare phase.
    pub(crate) fn accept_proposal(&self, message: Message) {
        let mut inner = self.0.lock().unwrap();
        inner.proposal_message = Some(message);
        inner.phase = Phase::Prepare;
    }

    /// Records the prepare quorum: caches the prepared block with its
    /// certificate and enters the commit phase.
    pub(crate) fn finalize_prepare(&self, certificate: PreparedCertificate, proposal: Payload) {
        let mut inner = self.0.lock().unwrap();
        inner.last_prepared_certificate = Some(certificate);
        inner.last_prepared_proposal = Some(proposal);
        inner.phase = Phase::Commit;
    }

    /// Records the committed seals collected from the COMMIT quorum.
    pub(crate) fn set_committed_seals(&self, seals: Vec<CommittedSeal>) {
        self.0.lock().unwrap().committed_seals = seals;
    }

    /// Enters the terminal phase. The block has been inserted.
    pub(crate) fn finalize(&self) {
        self.0.lock().unwrap().phase = Phase::Fin;
    }
}
