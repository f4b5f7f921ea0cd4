//! Configuration of the consensus engine.
use std::sync::Arc;

use zksync_concurrency::time;

use crate::{Backend, Transport};

/// Base duration of the round timer; doubled on every round change.
pub const DEFAULT_BASE_ROUND_TIMEOUT: time::Duration = time::Duration::seconds(10);

/// Upper bound on the exponential round timer. Consensus is unusable at
/// timeouts anywhere near this, but a bound keeps the arithmetic tame and
/// debugging sane.
pub const DEFAULT_MAX_ROUND_TIMEOUT: time::Duration = time::Duration::seconds(1_000_000);

/// Configuration of the consensus engine.
#[derive(Debug)]
pub struct Config {
    /// Application and cryptography capabilities.
    pub backend: Arc<dyn Backend>,
    /// Message gossip.
    pub transport: Arc<dyn Transport>,
    /// Base duration of the round timer.
    pub base_round_timeout: time::Duration,
    /// Upper bound on the exponential round timer.
    pub max_round_timeout: time::Duration,
}

impl Config {
    /// Configuration with the default round timer durations.
    pub fn new(backend: Arc<dyn Backend>, transport: Arc<dyn Transport>) -> Self {
        Self {
            backend,
            transport,
            base_round_timeout: DEFAULT_BASE_ROUND_TIMEOUT,
            max_round_timeout: DEFAULT_MAX_ROUND_TIMEOUT,
        }
    }
}
