//! # Core Configuration & Constants
//!
//! Every tunable of the consensus core lives here. If you are hardcoding a
//! timeout somewhere else, you are doing it wrong and you owe the team
//! coffee.
//!
//! Two layers:
//!
//! - Compile-time constants: protocol-level values that do not vary per
//!   deployment (sizes, identifiers, hard ceilings).
//! - [`CoreConfig`]: the runtime knobs, loadable from environment variables
//!   with sensible defaults. One struct, validated once at startup, then
//!   passed around immutably. The single exception is the finality window,
//!   which is admin-mutable at runtime and therefore lives behind a handle
//!   (see [`FinalityWindowHandle`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Constants
// ---------------------------------------------------------------------------

/// Address length in bytes. 20, Ethereum-style, because the L1 bridge speaks
/// that dialect and translating at every boundary is how bugs are born.
pub const ADDRESS_LENGTH: usize = 20;

/// Transaction hash length in bytes. BLAKE3 output, truncation-free.
pub const HASH_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes. If yours isn't, something has
/// gone terribly wrong.
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 public key length in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Hard ceiling on committee size, regardless of configuration or appeal
/// doubling. Committees beyond this burn executor capacity for no
/// measurable gain in confidence.
pub const MAX_COMMITTEE_SIZE: usize = 128;

/// Hard ceiling on the pending queue, regardless of configuration.
pub const MAX_PENDING_QUEUE: usize = 1_000_000;

/// How many times an `Overloaded` executor failure is retried within a
/// single round before the round gives up.
pub const EXECUTOR_OVERLOAD_RETRIES: u32 = 3;

/// Base backoff for executor overload retries. Doubles per attempt.
pub const EXECUTOR_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Grace period granted to an executor call after its cancellation token
/// fires. If the call is still running after this, the worker abandons it
/// and the round is recorded as lost.
pub const EXECUTOR_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Ceiling for the crawler's exponential error backoff.
pub const CRAWLER_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Core protocol version string, assembled at compile time.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Environment variable names
// ---------------------------------------------------------------------------

const ENV_FINALITY_WINDOW: &str = "CONCLAVE_FINALITY_WINDOW_SECONDS";
const ENV_MAX_ROTATIONS: &str = "CONCLAVE_MAX_ROTATIONS";
const ENV_COMMITTEE_SIZE: &str = "CONCLAVE_COMMITTEE_SIZE";
const ENV_WORKER_COUNT: &str = "CONCLAVE_WORKER_COUNT";
const ENV_LEADER_TIMEOUT: &str = "CONCLAVE_LEADER_TIMEOUT_SECONDS";
const ENV_VALIDATOR_TIMEOUT: &str = "CONCLAVE_VALIDATOR_TIMEOUT_SECONDS";
const ENV_GLOBAL_DEADLINE: &str = "CONCLAVE_GLOBAL_DEADLINE_SECONDS";
const ENV_CRAWLER_PERIOD: &str = "CONCLAVE_CRAWLER_PERIOD_MS";
const ENV_PENDING_QUEUE_MAX: &str = "CONCLAVE_PENDING_QUEUE_MAX";
const ENV_EVENT_BUS_BUFFER: &str = "CONCLAVE_EVENT_BUS_BUFFER";
const ENV_APPEAL_MULTIPLIER: &str = "CONCLAVE_APPEAL_COMMITTEE_MULTIPLIER";
const ENV_LEASE_SECONDS: &str = "CONCLAVE_WORKER_LEASE_SECONDS";

// ---------------------------------------------------------------------------
// CoreConfig
// ---------------------------------------------------------------------------

/// Runtime configuration for the consensus core.
///
/// Construct with [`CoreConfig::default`] for a production-shaped config,
/// [`CoreConfig::from_env`] to honor the `CONCLAVE_*` environment, or build
/// one by hand in tests (struct-update syntax keeps that painless).
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How long an Accepted transaction waits for appeals before it is
    /// promoted to Finalized. Zero means "finalize on the next sweep".
    pub finality_window: Duration,

    /// Maximum automatic rotations per appeal round. A rotation is a
    /// fresh leader + committee after a timeout or a disagreement
    /// majority; beyond this count the transaction closes terminally.
    pub max_rotations: u32,

    /// Default committee size for transactions that do not request one.
    pub committee_size: usize,

    /// Number of consensus workers. Each handles one transaction at a
    /// time; defaults to the machine's core count.
    pub worker_count: usize,

    /// How long the leader may take to produce a receipt per round.
    pub leader_timeout: Duration,

    /// How long validators may take to commit and reveal per round.
    pub validator_timeout: Duration,

    /// Total wall-clock budget for a transaction across all rotations and
    /// appeals. On breach the transaction closes as Undetermined.
    pub global_deadline: Duration,

    /// Period of the crawler's activation scan.
    pub crawler_period: Duration,

    /// Maximum number of PENDING transactions held at once. Ingress
    /// refuses new submissions beyond this.
    pub pending_queue_max: usize,

    /// Per-subscriber event buffer depth before coalescing kicks in.
    pub event_bus_buffer: usize,

    /// Committee growth factor applied per appeal. Default doubles.
    pub appeal_committee_multiplier: u32,

    /// Worker lease duration. Heartbeats renew at a third of this; a
    /// missed renewal lets the dispatcher reclaim the transaction.
    pub worker_lease: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            finality_window: Duration::from_secs(1800),
            max_rotations: 3,
            committee_size: 5,
            worker_count: default_worker_count(),
            leader_timeout: Duration::from_secs(60),
            validator_timeout: Duration::from_secs(120),
            global_deadline: Duration::from_secs(600),
            crawler_period: Duration::from_millis(500),
            pending_queue_max: 10_000,
            event_bus_buffer: 256,
            appeal_committee_multiplier: 2,
            worker_lease: Duration::from_secs(60),
        }
    }
}

/// Errors raised by [`CoreConfig::validate`] and [`CoreConfig::from_env`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value that does not parse.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    /// A parsed configuration failed a sanity check.
    #[error("configuration rejected: {0}")]
    Rejected(String),
}

impl CoreConfig {
    /// Loads configuration from `CONCLAVE_*` environment variables,
    /// falling back to defaults for anything unset, then validates.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(secs) = read_u64(ENV_FINALITY_WINDOW)? {
            cfg.finality_window = Duration::from_secs(secs);
        }
        if let Some(n) = read_u64(ENV_MAX_ROTATIONS)? {
            cfg.max_rotations = n as u32;
        }
        if let Some(n) = read_u64(ENV_COMMITTEE_SIZE)? {
            cfg.committee_size = n as usize;
        }
        if let Some(n) = read_u64(ENV_WORKER_COUNT)? {
            cfg.worker_count = n as usize;
        }
        if let Some(secs) = read_u64(ENV_LEADER_TIMEOUT)? {
            cfg.leader_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_u64(ENV_VALIDATOR_TIMEOUT)? {
            cfg.validator_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_u64(ENV_GLOBAL_DEADLINE)? {
            cfg.global_deadline = Duration::from_secs(secs);
        }
        if let Some(ms) = read_u64(ENV_CRAWLER_PERIOD)? {
            cfg.crawler_period = Duration::from_millis(ms);
        }
        if let Some(n) = read_u64(ENV_PENDING_QUEUE_MAX)? {
            cfg.pending_queue_max = n as usize;
        }
        if let Some(n) = read_u64(ENV_EVENT_BUS_BUFFER)? {
            cfg.event_bus_buffer = n as usize;
        }
        if let Some(n) = read_u64(ENV_APPEAL_MULTIPLIER)? {
            cfg.appeal_committee_multiplier = n as u32;
        }
        if let Some(secs) = read_u64(ENV_LEASE_SECONDS)? {
            cfg.worker_lease = Duration::from_secs(secs);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects configurations that cannot work. Called by `from_env`;
    /// call it yourself if you build a config by hand outside tests.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.committee_size == 0 {
            return Err(ConfigError::Rejected(
                "committee_size must be at least 1".into(),
            ));
        }
        if self.committee_size > MAX_COMMITTEE_SIZE {
            return Err(ConfigError::Rejected(format!(
                "committee_size {} exceeds ceiling {}",
                self.committee_size, MAX_COMMITTEE_SIZE
            )));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Rejected(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.pending_queue_max == 0 || self.pending_queue_max > MAX_PENDING_QUEUE {
            return Err(ConfigError::Rejected(format!(
                "pending_queue_max must be in 1..={}",
                MAX_PENDING_QUEUE
            )));
        }
        if self.appeal_committee_multiplier == 0 {
            return Err(ConfigError::Rejected(
                "appeal_committee_multiplier must be at least 1".into(),
            ));
        }
        if self.event_bus_buffer == 0 {
            return Err(ConfigError::Rejected(
                "event_bus_buffer must be at least 1".into(),
            ));
        }
        if self.worker_lease.is_zero() {
            return Err(ConfigError::Rejected("worker_lease must be non-zero".into()));
        }
        Ok(())
    }

    /// Heartbeat interval derived from the lease: lease/3, floor 1 second.
    pub fn heartbeat_interval(&self) -> Duration {
        std::cmp::max(self.worker_lease / 3, Duration::from_secs(1))
    }

    /// Sweep period for the finalization timer: window/100, floor 25 ms.
    /// The window is the user-facing guarantee; the sweep just has to be
    /// comfortably finer than it.
    pub fn finality_sweep_period(&self) -> Duration {
        std::cmp::max(self.finality_window / 100, Duration::from_millis(25))
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn read_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// FinalityWindowHandle
// ---------------------------------------------------------------------------

/// Shared, admin-mutable view of the finality window.
///
/// `set_finality_window` over RPC updates every reader at once: the
/// finalization timer, the appeal engine, and the status API all consult
/// the same handle. Stored as millis in an atomic so readers never lock.
#[derive(Debug, Clone)]
pub struct FinalityWindowHandle {
    millis: Arc<AtomicU64>,
}

impl FinalityWindowHandle {
    pub fn new(window: Duration) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(window.as_millis() as u64)),
        }
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Relaxed))
    }

    pub fn set(&self, window: Duration) {
        self.millis
            .store(window.as_millis() as u64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        CoreConfig::default().validate().expect("defaults must be sane");
    }

    #[test]
    fn zero_committee_rejected() {
        let cfg = CoreConfig {
            committee_size: 0,
            ..CoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_committee_rejected() {
        let cfg = CoreConfig {
            committee_size: MAX_COMMITTEE_SIZE + 1,
            ..CoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = CoreConfig {
            worker_count: 0,
            ..CoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn heartbeat_is_a_third_of_lease() {
        let cfg = CoreConfig {
            worker_lease: Duration::from_secs(60),
            ..CoreConfig::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(20));
    }

    #[test]
    fn heartbeat_floor_applies_to_tiny_leases() {
        let cfg = CoreConfig {
            worker_lease: Duration::from_millis(1500),
            ..CoreConfig::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn finality_sweep_has_a_floor() {
        let cfg = CoreConfig {
            finality_window: Duration::ZERO,
            ..CoreConfig::default()
        };
        assert_eq!(cfg.finality_sweep_period(), Duration::from_millis(25));
    }

    #[test]
    fn finality_sweep_scales_with_window() {
        let cfg = CoreConfig {
            finality_window: Duration::from_secs(1000),
            ..CoreConfig::default()
        };
        assert_eq!(cfg.finality_sweep_period(), Duration::from_secs(10));
    }

    #[test]
    fn window_handle_roundtrip() {
        let handle = FinalityWindowHandle::new(Duration::from_secs(10));
        assert_eq!(handle.get(), Duration::from_secs(10));

        handle.set(Duration::from_secs(3));
        assert_eq!(handle.get(), Duration::from_secs(3));

        let clone = handle.clone();
        clone.set(Duration::ZERO);
        assert_eq!(handle.get(), Duration::ZERO, "handles share state");
    }
}
