//! The IBFT consensus engine. It drives a set of validator nodes to
//! agreement on one block per height, tolerating up to f Byzantine
//! validators out of n = 3f + 1.
//!
//! The engine owns the round state machine (PRE-PREPARE, PREPARE, COMMIT,
//! FIN), the round change protocol that recovers from faulty proposers, and
//! the validation of prepared / round change certificates. Everything else
//! is delegated: cryptography, block production and validity to [`Backend`],
//! gossip to [`Transport`]. Logging goes through `tracing`.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use ibft_messages::{
    CommittedSeal, Message, MessageStore, NodeId, Payload, PayloadHash, PreparedCertificate,
    RoundChangeCertificate, View,
};
use zksync_concurrency::{ctx, time};

pub use crate::{
    config::Config,
    validation::{CertificateError, ProposalError},
};

mod config;
mod metrics;
mod round;
mod sequence;
mod state;
pub mod testonly;
#[cfg(test)]
mod tests;
mod validation;

/// Application and cryptography capabilities the engine is instantiated
/// with. The engine treats node ids, payloads, hashes and seals as opaque
/// bytes; every interpretation goes through this trait.
#[async_trait::async_trait]
pub trait Backend: std::fmt::Debug + Send + Sync {
    /// This node's identifier.
    fn id(&self) -> NodeId;
    /// Number of matching votes required at the given height,
    /// typically 2f + 1.
    fn quorum(&self, height: u64) -> usize;
    /// Maximum number of faulty validators tolerated at the given height,
    /// typically f. Used by the round fast-forward rule: f + 1 round change
    /// messages for a later round prove at least one honest node moved on.
    fn max_faulty(&self, height: u64) -> usize;
    /// Whether `id` is the proposer of the given (height, round).
    fn is_proposer(&self, id: &NodeId, height: u64, round: u64) -> bool;
    /// Builds a fresh block proposal for the given height.
    async fn build_proposal(&self, ctx: &ctx::Ctx, height: u64) -> ctx::Result<Payload>;
    /// Builds a signed PRE-PREPARE carrying `proposal` and, at rounds > 0,
    /// the round change certificate justifying it.
    fn build_pre_prepare(
        &self,
        proposal: Payload,
        certificate: Option<RoundChangeCertificate>,
        view: View,
    ) -> Message;
    /// Builds a signed PREPARE for the given proposal hash.
    fn build_prepare(&self, proposal_hash: PayloadHash, view: View) -> Message;
    /// Builds a signed COMMIT for the given proposal hash, including this
    /// node's committed seal.
    fn build_commit(&self, proposal_hash: PayloadHash, view: View) -> Message;
    /// Builds a signed ROUND-CHANGE carrying the last prepared block and its
    /// certificate, if this node prepared anything within the height.
    fn build_round_change(
        &self,
        last_prepared_block: Option<Payload>,
        last_prepared_certificate: Option<PreparedCertificate>,
        view: View,
    ) -> Message;
    /// Application-level validity of a proposed block.
    fn is_valid_block(&self, proposal: &Payload) -> bool;
    /// Whether `hash` is the correct hash of `proposal`.
    fn is_valid_proposal_hash(&self, proposal: &Payload, hash: &PayloadHash) -> bool;
    /// Whether the message's claimed sender checks out (signature, validator
    /// set membership).
    fn is_valid_sender(&self, message: &Message) -> bool;
    /// Hands the committed block and the quorum of committed seals to the
    /// application. Called exactly once per sequence.
    async fn insert_block(
        &self,
        ctx: &ctx::Ctx,
        proposal: &Payload,
        seals: Vec<CommittedSeal>,
    ) -> ctx::Result<()>;
}

/// Message gossip. Delivery is best effort, unordered and possibly
/// duplicated; the engine's own messages are expected to loop back through
/// [`IBFT::add_message`] like everyone else's.
pub trait Transport: std::fmt::Debug + Send + Sync {
    /// Multicasts a message to all validators.
    fn multicast(&self, message: Message);
}

/// The consensus engine for a single node. Create one per node, feed it
/// messages via [`IBFT::add_message`] from any thread, and drive it one
/// height at a time via [`IBFT::run_sequence`].
#[derive(Debug)]
pub struct IBFT {
    pub(crate) config: Config,
    pub(crate) messages: MessageStore,
    pub(crate) state: state::State,
    /// Extra duration added on top of the exponential round timeout,
    /// in nanoseconds.
    additional_timeout_ns: AtomicI64,
}

impl IBFT {
    /// Constructs the engine.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            messages: MessageStore::new(),
            state: state::State::default(),
            additional_timeout_ns: AtomicI64::new(0),
        }
    }

    /// Validates the sender and view of an incoming message and buffers it.
    /// Messages for past views are dropped silently; messages for future
    /// views are buffered so that the engine can catch up to them.
    /// Callable from any thread.
    pub fn add_message(&self, message: Message) {
        let label = metrics::MsgLabel::from(message.kind());
        if !self.is_acceptable_message(&message) {
            metrics::METRICS.message_ingress[&label.dropped()].inc();
            tracing::debug!(
                view = ?message.view,
                from = ?message.from,
                kind = message.kind().label(),
                "dropping unacceptable message",
            );
            return;
        }
        metrics::METRICS.message_ingress[&label.accepted()].inc();
        self.messages.add(message);
    }

    /// Extends the round timeout of the current and all future rounds.
    /// Useful when the application knows block production is momentarily
    /// slow and round changes would only thrash.
    pub fn extend_round_timeout(&self, duration: time::Duration) {
        let ns = i64::try_from(duration.whole_nanoseconds()).unwrap_or(i64::MAX);
        self.additional_timeout_ns.store(ns, Ordering::Relaxed);
    }

    /// The currently configured additional round timeout.
    pub(crate) fn additional_timeout(&self) -> time::Duration {
        time::Duration::nanoseconds(self.additional_timeout_ns.load(Ordering::Relaxed))
    }

    /// Timeout of the given round: the configured base duration doubled
    /// every round (capped), plus the additional timeout.
    pub(crate) fn round_timeout(&self, round: u64) -> time::Duration {
        let exp = u32::try_from(round).unwrap_or(u32::MAX);
        let factor = i32::try_from(2u64.saturating_pow(exp)).unwrap_or(i32::MAX);
        let timeout = self
            .config
            .base_round_timeout
            .saturating_mul(factor)
            .min(self.config.max_round_timeout);
        timeout.saturating_add(self.additional_timeout())
    }

    /// Shorthand for the backend.
    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.config.backend
    }
}
