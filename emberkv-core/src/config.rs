use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`Store`](crate::Store).
///
/// # Example
///
/// ```rust
/// use emberkv_core::StoreConfig;
/// use std::time::Duration;
///
/// let config = StoreConfig::default()
///     .with_db_root("/var/lib/emberkv")
///     .with_sweep_interval(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory of the on-disk database (default: `db`).
    pub db_root: PathBuf,

    /// Interval between expiry sweeps (default: 60 seconds).
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_root: PathBuf::from("db"),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the root directory for the on-disk database.
    pub fn with_db_root(mut self, db_root: impl Into<PathBuf>) -> Self {
        self.db_root = db_root.into();
        self
    }

    /// Sets the interval between expiry sweeps.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
