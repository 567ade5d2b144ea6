//! # Handle Configuration

use std::time::Duration;

// =============================================================================
// LOCK CONFIGURATION
// =============================================================================

/// Retry policy for blocking mutex acquisition
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Wait time before the first "still waiting" warning
    pub warn_after: Duration,
    /// Interval between subsequent warnings
    pub warn_interval: Duration,
    /// First backoff delay after a contended attempt
    pub initial_backoff: Duration,
    /// Upper bound of the exponential backoff
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            warn_after: Duration::from_secs(15),
            warn_interval: Duration::from_secs(60),
            initial_backoff: Duration::from_micros(1),
            max_backoff: Duration::from_millis(1),
        }
    }
}

impl LockConfig {
    /// Spin without sleeping (tests, simulated devices)
    pub fn busy_poll() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Default::default()
        }
    }
}

// =============================================================================
// HANDLE CONFIGURATION
// =============================================================================

/// Device handle configuration
#[derive(Debug, Clone)]
pub struct CppConfig {
    /// Take the handle lock around serialized backend calls.
    ///
    /// Required when the backend is not reentrant from multiple threads.
    pub serialize: bool,
    /// Mutex retry policy
    pub lock: LockConfig,
}

impl Default for CppConfig {
    fn default() -> Self {
        Self {
            serialize: cfg!(feature = "serialize-all"),
            lock: LockConfig::default(),
        }
    }
}

impl CppConfig {
    /// Configuration for a backend that needs the driver lock
    pub fn serialized() -> Self {
        Self {
            serialize: true,
            ..Default::default()
        }
    }

    /// Replace the mutex retry policy
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }
}
