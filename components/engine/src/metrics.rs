//! Metrics for the consensus engine.
use std::time::Duration;

use ibft_messages::MsgType;
use vise::{Buckets, Counter, EncodeLabelSet, EncodeLabelValue, Family, Gauge, Histogram, Metrics,
    Unit};

/// Label for a protocol message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum MsgLabel {
    /// Label for a PRE-PREPARE message.
    PrePrepare,
    /// Label for a PREPARE message.
    Prepare,
    /// Label for a COMMIT message.
    Commit,
    /// Label for a ROUND-CHANGE message.
    RoundChange,
}

impl From<MsgType> for MsgLabel {
    fn from(kind: MsgType) -> Self {
        match kind {
            MsgType::PrePrepare => Self::PrePrepare,
            MsgType::Prepare => Self::Prepare,
            MsgType::Commit => Self::Commit,
            MsgType::RoundChange => Self::RoundChange,
        }
    }
}

impl MsgLabel {
    /// This kind, buffered.
    pub(crate) fn accepted(self) -> IngressLabels {
        IngressLabels {
            r#type: self,
            outcome: OutcomeLabel::Accepted,
        }
    }

    /// This kind, dropped at ingress.
    pub(crate) fn dropped(self) -> IngressLabels {
        IngressLabels {
            r#type: self,
            outcome: OutcomeLabel::Dropped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
enum OutcomeLabel {
    Accepted,
    Dropped,
}

/// Labels for the message ingress counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelSet)]
pub(crate) struct IngressLabels {
    r#type: MsgLabel,
    outcome: OutcomeLabel,
}

/// Metrics defined by the consensus engine.
#[derive(Debug, Metrics)]
#[metrics(prefix = "ibft")]
pub(crate) struct EngineMetrics {
    /// Round the engine is currently in.
    pub(crate) round_number: Gauge<u64>,
    /// Height of the last finalized block.
    pub(crate) finalized_height: Gauge<u64>,
    /// Latency of a full sequence, from the first round to block insertion.
    #[metrics(buckets = Buckets::exponential(0.125..=512.0, 2.0), unit = Unit::Seconds)]
    pub(crate) sequence_latency: Histogram<Duration>,
    /// Latency of a single round, however it settled.
    #[metrics(buckets = Buckets::exponential(0.125..=64.0, 2.0), unit = Unit::Seconds)]
    pub(crate) round_latency: Histogram<Duration>,
    /// Messages observed at ingress, by kind and outcome.
    pub(crate) message_ingress: Family<IngressLabels, Counter>,
}

/// Clamps a signed monotonic-clock difference to the std range for
/// histogram observation.
pub(crate) fn to_std_duration(latency: zksync_concurrency::time::Duration) -> Duration {
    Duration::try_from(latency).unwrap_or(Duration::ZERO)
}

/// Global instance of [`EngineMetrics`].
#[vise::register]
pub(crate) static METRICS: vise::Global<EngineMetrics> = vise::Global::new();
