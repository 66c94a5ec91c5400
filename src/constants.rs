//! Defaults, timeouts and limits shared across the crate.
//!
//! All magic numbers live here so that the descriptor loader, the health
//! aggregator and the launcher agree on them.

use std::time::Duration;

// =============================================================================
// Descriptor Defaults
// =============================================================================

/// Default health check interval when the descriptor leaves it unset.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Default grace period between `rkt stop` and a process-group kill.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// File names probed, in order, when the descriptor path is a directory.
pub const DESCRIPTOR_FILE_CANDIDATES: [&str; 3] =
    ["pod.json", "docker-compose.yml", "docker-compose.yaml"];

/// Highest docker-compose version this loader understands.
pub const MAX_SUPPORTED_COMPOSE_VERSION: f64 = 3.0;

// =============================================================================
// Health Checks
// =============================================================================

/// Warm-up poll cadence ceiling; the effective value is
/// `min(WARMUP_INTERVAL_CEILING, check interval)`.
pub const WARMUP_INTERVAL_CEILING: Duration = Duration::from_secs(1);

/// Number of warm-up polls before a check falls back to its steady interval.
pub const WARMUP_POLLS: u32 = 10;

/// Extra time an indicator subprocess gets to flush output after SIGINT/SIGKILL.
pub const INDICATOR_KILL_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Launcher
// =============================================================================

/// Number of `rkt status` polls while waiting for the pod to come up.
pub const STATUS_POLL_ATTEMPTS: u32 = 40;

/// Delay between `rkt status` polls.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// `--wait-ready` value passed to `rkt status`.
pub const STATUS_WAIT_READY: &str = "5s";

/// Mode for volume directories created on behalf of the pod.
pub const VOLUME_DIR_MODE: u32 = 0o755;

// =============================================================================
// Consul
// =============================================================================

/// Per-request timeout of the registry HTTP client.
pub const CONSUL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle connections the registry client keeps pooled.
pub const CONSUL_MAX_IDLE_CONNECTIONS: usize = 10;

/// Idle timeout for pooled registry connections.
pub const CONSUL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Availability probe retries performed when the lifecycle factory is built.
pub const CONSUL_AVAILABILITY_RETRIES: u32 = 30;

/// Delay between availability probes.
pub const CONSUL_AVAILABILITY_RETRY_DELAY: Duration = Duration::from_secs(1);
