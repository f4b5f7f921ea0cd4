//! The sequence engine: runs one height to commit. It loops rounds,
//! spawning for each a structured scope with the round engine, the round
//! timer and the future-round watchers; whichever signals first decides how
//! the sequence proceeds. The block insertion at FIN happens exactly once,
//! on the sequence's critical path, before `run_sequence` returns.
use anyhow::Context as _;
use ibft_messages::{Message, MsgType, SubscriptionDetails, View};
use zksync_concurrency::{ctx, error::Wrap as _, scope, time};

use crate::{metrics, IBFT};

/// Events that settle a round, sent to the sequence engine over the round
/// event channel. The first event wins; the round scope is torn down before
/// the event is handled.
#[derive(Debug)]
pub(crate) enum RoundEvent {
    /// The round engine collected the commit quorum.
    RoundDone,
    /// The round timer expired without progress.
    TimerExpired,
    /// Enough ROUND-CHANGE messages for a later round arrived to prove at
    /// least one honest node moved on (the f + 1 fast-forward rule).
    FastForward {
        /// The later round.
        round: u64,
    },
    /// A quorum of ROUND-CHANGE messages materialized for a later round.
    RoundCertificate {
        /// The justified round.
        round: u64,
    },
    /// A valid proposal for a later round arrived.
    FutureProposal {
        /// The proposal's round.
        round: u64,
        /// The validated PRE-PREPARE.
        message: Box<Message>,
    },
}

/// Background tasks of a round scope are canceled when the round settles;
/// that is their normal exit, not an error.
fn squash_canceled(res: ctx::Result<()>) -> ctx::Result<()> {
    match res {
        Err(ctx::Error::Canceled(_)) => Ok(()),
        other => other,
    }
}

impl IBFT {
    /// Runs the consensus sequence for the given height, blocking until the
    /// block is committed and inserted or the context is canceled. On
    /// cancellation nothing is inserted and `ctx::Canceled` is returned.
    pub async fn run_sequence(&self, ctx: &ctx::Ctx, height: u64) -> ctx::Result<()> {
        self.state.reset(height);
        self.messages.prune_by_height(height);
        tracing::info!(height, "starting sequence");
        let sequence_start = ctx.now();

        loop {
            let view = self.state.view();
            metrics::METRICS.round_number.set(view.round);
            tracing::debug!(height, round = view.round, phase = %self.state.phase(), "starting round");
            let round_start = ctx.now();

            let event = self.run_round_with_watchers(ctx, view).await?;
            metrics::METRICS
                .round_latency
                .observe(metrics::to_std_duration(ctx.now() - round_start));

            match event {
                RoundEvent::RoundDone => {
                    let proposal = self
                        .state
                        .proposal()
                        .context("commit quorum without an accepted proposal")?;
                    let seals = self.state.committed_seals();
                    self.backend()
                        .insert_block(ctx, &proposal, seals)
                        .await
                        .wrap("insert_block()")?;
                    self.state.finalize();
                    self.messages.prune_by_height(height + 1);
                    metrics::METRICS.finalized_height.set(height);
                    metrics::METRICS
                        .sequence_latency
                        .observe(metrics::to_std_duration(ctx.now() - sequence_start));
                    tracing::info!(height, round = view.round, "sequence finished");
                    return Ok(());
                }
                RoundEvent::TimerExpired => {
                    tracing::debug!(height, round = view.round, "round timer expired");
                    let next = view.next_round();
                    self.multicast_round_change(next);
                    self.move_to_round(next);
                }
                RoundEvent::FastForward { round } => {
                    tracing::debug!(height, round, "fast-forwarding to a later round");
                    let target = View { height, round };
                    self.multicast_round_change(target);
                    self.move_to_round(target);
                }
                RoundEvent::RoundCertificate { round } => {
                    tracing::debug!(height, round, "round change certificate for a later round");
                    self.move_to_round(View { height, round });
                }
                RoundEvent::FutureProposal { round, message } => {
                    tracing::debug!(height, round, "jumping to a later round with its proposal");
                    let target = View { height, round };
                    self.move_to_round(target);
                    let hash = message
                        .pre_prepare()
                        .context("future proposal is not a PRE-PREPARE")?
                        .proposal_hash
                        .clone();
                    self.state.accept_proposal(*message);
                    self.state.set_round_started(true);
                    self.config
                        .transport
                        .multicast(self.backend().build_prepare(hash, target));
                }
            }
        }
    }

    /// One round: spawns the round engine, the timer and the watchers in a
    /// scope and waits for the first settling event. All tasks are canceled
    /// and joined before this returns.
    pub(crate) async fn run_round_with_watchers(
        &self,
        ctx: &ctx::Ctx,
        view: View,
    ) -> ctx::Result<RoundEvent> {
        let timeout = self.round_timeout(view.round);
        let (send, mut recv) = ctx::channel::unbounded();
        scope::run!(ctx, |ctx, s| async {
            s.spawn_bg(async { squash_canceled(self.run_round(ctx, &send).await) });
            s.spawn_bg(async { squash_canceled(self.round_timer(ctx, timeout, &send).await) });
            s.spawn_bg(async {
                squash_canceled(self.watch_for_future_proposal(ctx, view, &send).await)
            });
            s.spawn_bg(async {
                squash_canceled(self.watch_for_round_certificate(ctx, view, &send).await)
            });
            s.spawn_bg(async { squash_canceled(self.watch_for_fast_forward(ctx, view, &send).await) });

            let event = recv.recv(ctx).await?;
            Ok(event)
        })
        .await
    }

    /// The round timer. Expiry is the sole driver of forward progress when
    /// proposers fail.
    async fn round_timer(
        &self,
        ctx: &ctx::Ctx,
        timeout: time::Duration,
        events: &ctx::channel::UnboundedSender<RoundEvent>,
    ) -> ctx::Result<()> {
        ctx.sleep(timeout).await?;
        events.send(RoundEvent::TimerExpired);
        Ok(())
    }

    /// Watches for a valid PRE-PREPARE at any round above the current one.
    /// Such a proposal is self-justifying (its round change certificate is
    /// validated), so the sequence can jump straight into its round.
    pub(crate) async fn watch_for_future_proposal(
        &self,
        ctx: &ctx::Ctx,
        view: View,
        events: &ctx::channel::UnboundedSender<RoundEvent>,
    ) -> ctx::Result<()> {
        let mut sub = self.messages.subscribe(SubscriptionDetails {
            view: view.next_round(),
            kind: MsgType::PrePrepare,
            min_count: 1,
            any_round_geq: true,
        });
        let res = loop {
            match sub.notify.recv(ctx).await {
                Ok(round) => {
                    let target = View {
                        height: view.height,
                        round,
                    };
                    let proposals =
                        self.messages
                            .get_valid(target, MsgType::PrePrepare, |m| {
                                match self.validate_proposal(m, target) {
                                    Ok(()) => true,
                                    Err(err) => {
                                        tracing::debug!(
                                            from = ?m.from,
                                            round,
                                            "rejecting future proposal: {err}",
                                        );
                                        false
                                    }
                                }
                            });
                    if let Some(message) = proposals.into_iter().next() {
                        events.send(RoundEvent::FutureProposal {
                            round,
                            message: Box::new(message),
                        });
                        break Ok(());
                    }
                }
                Err(canceled) => break Err(canceled.into()),
            }
        };
        self.messages.unsubscribe(sub.id);
        res
    }

    /// Watches for a quorum of ROUND-CHANGE messages at any round above the
    /// current one, which justifies entering that round directly.
    pub(crate) async fn watch_for_round_certificate(
        &self,
        ctx: &ctx::Ctx,
        view: View,
        events: &ctx::channel::UnboundedSender<RoundEvent>,
    ) -> ctx::Result<()> {
        let quorum = self.backend().quorum(view.height);
        self.watch_round_changes(ctx, view, quorum, |round| RoundEvent::RoundCertificate {
            round,
        }, events)
        .await
    }

    /// Watches for f + 1 ROUND-CHANGE messages at any round above the
    /// current one. That many senders cannot all be faulty, so at least one
    /// honest node is already in a later round and this node should follow.
    pub(crate) async fn watch_for_fast_forward(
        &self,
        ctx: &ctx::Ctx,
        view: View,
        events: &ctx::channel::UnboundedSender<RoundEvent>,
    ) -> ctx::Result<()> {
        let threshold = self.backend().max_faulty(view.height) + 1;
        self.watch_round_changes(ctx, view, threshold, |round| RoundEvent::FastForward {
            round,
        }, events)
        .await
    }

    /// Shared loop of the two round change watchers: wake on `threshold`
    /// buffered ROUND-CHANGE messages at a round above `view.round`,
    /// re-check them and emit the event for the satisfied round.
    async fn watch_round_changes(
        &self,
        ctx: &ctx::Ctx,
        view: View,
        threshold: usize,
        event: impl Fn(u64) -> RoundEvent,
        events: &ctx::channel::UnboundedSender<RoundEvent>,
    ) -> ctx::Result<()> {
        let mut sub = self.messages.subscribe(SubscriptionDetails {
            view: view.next_round(),
            kind: MsgType::RoundChange,
            min_count: threshold,
            any_round_geq: true,
        });
        let res = loop {
            match sub.notify.recv(ctx).await {
                Ok(round) => {
                    let target = View {
                        height: view.height,
                        round,
                    };
                    let round_changes = self.messages.get_valid(target, MsgType::RoundChange, |m| {
                        self.is_valid_round_change(m, target)
                    });
                    if round_changes.len() >= threshold {
                        events.send(event(round));
                        break Ok(());
                    }
                }
                Err(canceled) => break Err(canceled.into()),
            }
        };
        self.messages.unsubscribe(sub.id);
        res
    }

    /// Multicasts this node's ROUND-CHANGE for the given view, carrying the
    /// last prepared block and certificate if the node prepared anything
    /// within the height.
    fn multicast_round_change(&self, view: View) {
        let (block, certificate) = self.state.last_prepared();
        self.config
            .transport
            .multicast(self.backend().build_round_change(block, certificate, view));
    }

    /// Moves the state to a new round of the current height and drops the
    /// now-stale message buckets below it.
    fn move_to_round(&self, view: View) {
        self.state.set_view(view);
        self.messages.prune_by_round(view);
    }
}
