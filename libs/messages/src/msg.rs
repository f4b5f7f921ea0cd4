//! Messages exchanged by the IBFT consensus protocol.
use std::fmt;

/// A protocol instance identifier: the height of the block being agreed on
/// and the retry round within that height.
/// The derived ordering is lexicographic (height first), which is exactly
/// the "newer view" ordering the protocol needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct View {
    /// The height of the block this view belongs to.
    pub height: u64,
    /// The round within the height. Incremented on timeout or via a
    /// round change certificate.
    pub round: u64,
}

impl View {
    /// The same height, one round later.
    pub fn next_round(self) -> Self {
        Self {
            height: self.height,
            round: self.round + 1,
        }
    }
}

/// Opaque identifier of a validator node. The engine never interprets it;
/// equality and ordering are all that is needed.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub Vec<u8>);

impl NodeId {
    /// Node id from a byte string.
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Self(id.into())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "node:{}", self.0.escape_ascii())
    }
}

/// Opaque block payload proposed by the proposer of a view.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "payload:[{}B]", self.0.len())
    }
}

/// Opaque hash of a block payload. Computed and verified by the application
/// backend; the engine only compares it for equality.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct PayloadHash(pub Vec<u8>);

impl fmt::Debug for PayloadHash {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "hash:{}", self.0.escape_ascii())
    }
}

/// Discriminant of the four protocol message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MsgType {
    /// The proposer's block proposal for a view.
    PrePrepare,
    /// A validator's vote for a proposal.
    Prepare,
    /// A validator's commitment to a prepared proposal.
    Commit,
    /// A validator's request to move to a later round.
    RoundChange,
}

impl MsgType {
    /// Human readable label, used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PrePrepare => "pre_prepare",
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::RoundChange => "round_change",
        }
    }
}

/// Payload of a PRE-PREPARE message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrePrepare {
    /// The proposed block.
    pub proposal: Payload,
    /// Hash of the proposed block.
    pub proposal_hash: PayloadHash,
    /// Round change certificate justifying the proposal.
    /// Absent at round 0, mandatory at later rounds.
    pub certificate: Option<RoundChangeCertificate>,
}

/// Payload of a PREPARE message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prepare {
    /// Hash of the proposal being voted for.
    pub proposal_hash: PayloadHash,
}

/// Payload of a COMMIT message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    /// Hash of the proposal being committed.
    pub proposal_hash: PayloadHash,
    /// The sender's signature over the committed value.
    pub committed_seal: Vec<u8>,
}

/// Payload of a ROUND-CHANGE message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundChange {
    /// The block this node last prepared within the height, if any.
    pub last_prepared_block: Option<Payload>,
    /// Proof that `last_prepared_block` was prepared at some earlier round.
    pub last_prepared_certificate: Option<PreparedCertificate>,
}

/// The variant-specific payload of a protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusMsg {
    /// See [`PrePrepare`].
    PrePrepare(PrePrepare),
    /// See [`Prepare`].
    Prepare(Prepare),
    /// See [`Commit`].
    Commit(Commit),
    /// See [`RoundChange`].
    RoundChange(RoundChange),
}

impl ConsensusMsg {
    /// The kind of this message.
    pub fn kind(&self) -> MsgType {
        match self {
            Self::PrePrepare(_) => MsgType::PrePrepare,
            Self::Prepare(_) => MsgType::Prepare,
            Self::Commit(_) => MsgType::Commit,
            Self::RoundChange(_) => MsgType::RoundChange,
        }
    }
}

/// A protocol message: the view it belongs to, the claimed sender and the
/// kind-specific payload. Sender authentication is the transport/backend's
/// business; by the time a message reaches the engine, `from` is trusted
/// exactly as far as `Backend::is_valid_sender` says.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// The view this message belongs to.
    pub view: View,
    /// The sender of the message.
    pub from: NodeId,
    /// The kind-specific payload.
    pub msg: ConsensusMsg,
}

impl Message {
    /// The kind of this message.
    pub fn kind(&self) -> MsgType {
        self.msg.kind()
    }

    /// The PRE-PREPARE payload, if this is a proposal.
    pub fn pre_prepare(&self) -> Option<&PrePrepare> {
        match &self.msg {
            ConsensusMsg::PrePrepare(pp) => Some(pp),
            _ => None,
        }
    }

    /// The ROUND-CHANGE payload, if this is a round change.
    pub fn round_change(&self) -> Option<&RoundChange> {
        match &self.msg {
            ConsensusMsg::RoundChange(rc) => Some(rc),
            _ => None,
        }
    }

    /// The proposal hash this message refers to.
    /// ROUND-CHANGE messages carry no hash of their own.
    pub fn proposal_hash(&self) -> Option<&PayloadHash> {
        match &self.msg {
            ConsensusMsg::PrePrepare(pp) => Some(&pp.proposal_hash),
            ConsensusMsg::Prepare(p) => Some(&p.proposal_hash),
            ConsensusMsg::Commit(c) => Some(&c.proposal_hash),
            ConsensusMsg::RoundChange(_) => None,
        }
    }

    /// The committed seal, if this is a COMMIT.
    pub fn committed_seal(&self) -> Option<&[u8]> {
        match &self.msg {
            ConsensusMsg::Commit(c) => Some(&c.committed_seal),
            _ => None,
        }
    }
}

/// Proof that a proposal was prepared at some round: the PRE-PREPARE and the
/// PREPARE votes backing it. Together with the proposal message the votes
/// must reach quorum for the certificate to be valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedCertificate {
    /// The PRE-PREPARE that was accepted. Boxed to break the type cycle
    /// with [`RoundChange`], which embeds certificates in messages.
    pub proposal_message: Box<Message>,
    /// The PREPARE votes matching the proposal.
    pub prepare_messages: Vec<Message>,
}

/// A quorum of ROUND-CHANGE messages justifying entry into a later round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundChangeCertificate(pub Vec<Message>);

impl RoundChangeCertificate {
    /// Number of round change messages in the certificate.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the certificate carries no messages at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A validator's signature over a committed value, paired with its identity.
/// Collected from COMMIT messages and handed to the application on insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedSeal {
    /// The validator that produced the seal.
    pub signer: NodeId,
    /// The signature bytes.
    pub signature: Vec<u8>,
}
