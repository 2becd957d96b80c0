//! Runtime configuration assembled from the command line.

use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffConfig;

/// Default network scan duration in seconds.
pub const DEFAULT_SCAN_TIMEOUT: u64 = 5;

/// Heartbeat gap in seconds treated as evidence of a system sleep.
pub const DEFAULT_WAKE_GAP: u64 = 5;

#[derive(Clone, Debug)]
pub struct Config {
    /// How long a network scan runs before reporting what it found.
    pub scan_timeout: Duration,

    /// Reconnection backoff schedule.
    pub backoff: BackoffConfig,

    /// Heartbeat gap beyond which a system wake is assumed.
    pub wake_gap: Duration,

    /// Where device credentials are persisted.
    pub storage_path: PathBuf,
}

/// Platform config directory, with a working-directory fallback for
/// containers that have no home.
#[must_use]
pub fn default_storage_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(env!("CARGO_PKG_NAME"));
    path.push("credentials.json");
    path
}
