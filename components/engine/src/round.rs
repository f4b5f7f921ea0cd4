//! The round engine: drives a single (height, round) through its phases.
//! The proposer builds (or re-proposes) a block and multicasts a
//! PRE-PREPARE; validators await one. Both then collect the PREPARE and
//! COMMIT quorums. Completion is signalled to the sequence engine over the
//! round event channel.
use anyhow::Context as _;
use ibft_messages::{
    CommittedSeal, Message, MsgType, PreparedCertificate, RoundChangeCertificate,
    SubscriptionDetails, View,
};
use zksync_concurrency::ctx;

use crate::{sequence::RoundEvent, state::Phase, IBFT};

impl IBFT {
    /// Runs the current round to completion, dispatching on the phase the
    /// sequence engine left the state in (a future-proposal jump enters the
    /// round mid-way, with a proposal already accepted). Sends
    /// [`RoundEvent::RoundDone`] once the commit quorum is collected.
    pub(crate) async fn run_round(
        &self,
        ctx: &ctx::Ctx,
        events: &ctx::channel::UnboundedSender<RoundEvent>,
    ) -> ctx::Result<()> {
        let view = self.state.view();
        self.state.set_round_started(true);

        if self.state.phase() == Phase::NewRound {
            self.run_new_round(ctx, view).await?;
        }
        if self.state.phase() == Phase::Prepare {
            self.run_prepare(ctx, view).await?;
        }
        if self.state.phase() == Phase::Commit {
            self.run_commit(ctx, view).await?;
        }

        events.send(RoundEvent::RoundDone);
        Ok(())
    }

    /// The proposal phase. The proposer of the view builds and multicasts a
    /// PRE-PREPARE and accepts it locally; everyone else awaits a proposal
    /// that survives [`IBFT::validate_proposal`].
    pub(crate) async fn run_new_round(&self, ctx: &ctx::Ctx, view: View) -> ctx::Result<()> {
        let backend = self.backend();
        if backend.is_proposer(&backend.id(), view.height, view.round) {
            self.propose(ctx, view).await
        } else {
            self.await_proposal(ctx, view).await
        }
    }

    /// Builds and multicasts this node's proposal for the view. At round 0
    /// the block is fresh and needs no justification. At later rounds the
    /// proposer first collects a quorum of ROUND-CHANGE messages; if any of
    /// them proves a block was already prepared, that block is re-proposed,
    /// otherwise a fresh one is built. The observed quorum is embedded as
    /// the round change certificate.
    async fn propose(&self, ctx: &ctx::Ctx, view: View) -> ctx::Result<()> {
        let backend = self.backend();
        let pre_prepare = if view.round == 0 {
            let proposal = backend.build_proposal(ctx, view.height).await?;
            backend.build_pre_prepare(proposal, None, view)
        } else {
            let round_changes = self.await_round_changes(ctx, view).await?;
            let proposal = match Self::highest_prepared(&round_changes) {
                Some(proposal) => {
                    tracing::debug!(
                        round = view.round,
                        "re-proposing the block prepared at an earlier round",
                    );
                    proposal
                }
                None => backend.build_proposal(ctx, view.height).await?,
            };
            backend.build_pre_prepare(proposal, Some(RoundChangeCertificate(round_changes)), view)
        };

        tracing::debug!(height = view.height, round = view.round, "multicasting proposal");
        self.config.transport.multicast(pre_prepare.clone());
        self.state.accept_proposal(pre_prepare);
        Ok(())
    }

    /// Awaits a quorum of ROUND-CHANGE messages for exactly this view.
    async fn await_round_changes(&self, ctx: &ctx::Ctx, view: View) -> ctx::Result<Vec<Message>> {
        let quorum = self.backend().quorum(view.height);
        let round_changes = self
            .await_threshold(ctx, view, MsgType::RoundChange, quorum, |m| {
                self.is_valid_round_change(m, view)
            })
            .await?;
        Ok(round_changes)
    }

    /// The block prepared at the highest round among the given ROUND-CHANGE
    /// messages, if any of them carries a prepared certificate.
    fn highest_prepared(round_changes: &[Message]) -> Option<ibft_messages::Payload> {
        round_changes
            .iter()
            .filter_map(|m| {
                let round_change = m.round_change()?;
                let certificate = round_change.last_prepared_certificate.as_ref()?;
                let block = round_change.last_prepared_block.as_ref()?;
                Some((certificate.proposal_message.view.round, block))
            })
            .max_by_key(|(round, _)| *round)
            .map(|(_, block)| block.clone())
    }

    /// Awaits a valid proposal for the view, accepts it and multicasts this
    /// node's PREPARE. Invalid proposals are logged and ignored; the wait
    /// continues until a valid one arrives or the round is torn down.
    async fn await_proposal(&self, ctx: &ctx::Ctx, view: View) -> ctx::Result<()> {
        let proposals = self
            .await_threshold(ctx, view, MsgType::PrePrepare, 1, |m| {
                match self.validate_proposal(m, view) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::debug!(from = ?m.from, "rejecting proposal: {err}");
                        false
                    }
                }
            })
            .await?;
        // The threshold wait guarantees at least one message.
        let proposal = proposals.into_iter().next().unwrap();
        let hash = proposal
            .pre_prepare()
            .context("validated proposal is not a PRE-PREPARE")?
            .proposal_hash
            .clone();

        tracing::debug!(
            height = view.height,
            round = view.round,
            from = ?proposal.from,
            "accepted proposal",
        );
        self.state.accept_proposal(proposal);
        self.config
            .transport
            .multicast(self.backend().build_prepare(hash, view));
        Ok(())
    }

    /// The prepare phase: await a quorum of PREPARE votes matching the
    /// accepted proposal, cache the prepared block with its certificate and
    /// multicast this node's COMMIT. The proposer's own PREPARE, which
    /// follows its proposal acceptance, is multicast here.
    pub(crate) async fn run_prepare(&self, ctx: &ctx::Ctx, view: View) -> ctx::Result<()> {
        let backend = self.backend();
        let hash = self
            .state
            .proposal_hash()
            .context("prepare phase without an accepted proposal")?;

        if backend.is_proposer(&backend.id(), view.height, view.round) {
            self.config
                .transport
                .multicast(backend.build_prepare(hash.clone(), view));
        }

        let quorum = backend.quorum(view.height);
        let prepares = self
            .await_threshold(ctx, view, MsgType::Prepare, quorum, |m| {
                backend.is_valid_sender(m) && m.proposal_hash() == Some(&hash)
            })
            .await?;

        let proposal_message = self
            .state
            .proposal_message()
            .context("prepare phase without an accepted proposal")?;
        let proposal = self
            .state
            .proposal()
            .context("prepare phase without an accepted proposal")?;
        let certificate = PreparedCertificate {
            proposal_message: Box::new(proposal_message),
            prepare_messages: prepares,
        };

        tracing::debug!(
            height = view.height,
            round = view.round,
            "prepare quorum reached, multicasting commit",
        );
        self.state.finalize_prepare(certificate, proposal);
        self.config
            .transport
            .multicast(backend.build_commit(hash, view));
        Ok(())
    }

    /// The commit phase: await a quorum of COMMIT votes matching the
    /// accepted proposal and collect their committed seals. The actual block
    /// insertion happens on the sequence engine's critical path.
    pub(crate) async fn run_commit(&self, ctx: &ctx::Ctx, view: View) -> ctx::Result<()> {
        let backend = self.backend();
        let hash = self
            .state
            .proposal_hash()
            .context("commit phase without an accepted proposal")?;

        let quorum = backend.quorum(view.height);
        let commits = self
            .await_threshold(ctx, view, MsgType::Commit, quorum, |m| {
                backend.is_valid_sender(m) && m.proposal_hash() == Some(&hash)
            })
            .await?;

        let seals = commits
            .into_iter()
            .filter_map(|m| {
                let signature = m.committed_seal()?.to_vec();
                Some(CommittedSeal {
                    signer: m.from,
                    signature,
                })
            })
            .collect();
        tracing::debug!(height = view.height, round = view.round, "commit quorum reached");
        self.state.set_committed_seals(seals);
        Ok(())
    }

    /// Subscribes for `kind` messages at exactly `view` and waits until at
    /// least `min_count` of them pass `is_valid`. The subscription is
    /// removed on the way out, cancellation included.
    async fn await_threshold(
        &self,
        ctx: &ctx::Ctx,
        view: View,
        kind: MsgType,
        min_count: usize,
        is_valid: impl Fn(&Message) -> bool,
    ) -> ctx::OrCanceled<Vec<Message>> {
        let mut sub = self.messages.subscribe(SubscriptionDetails {
            view,
            kind,
            min_count,
            any_round_geq: false,
        });
        let res = loop {
            match sub.notify.recv(ctx).await {
                Ok(_) => {
                    let messages = self.messages.get_valid(view, kind, &is_valid);
                    if messages.len() >= min_count {
                        break Ok(messages);
                    }
                }
                Err(canceled) => break Err(canceled),
            }
        };
        self.messages.unsubscribe(sub.id);
        res
    }
}
