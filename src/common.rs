use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

/// Default transfer chunk size in raw bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1_058_576;
/// Default per-connection timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default interval between two status reports of the server counters.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);
/// Default size of the dispatch pool.
pub const DEFAULT_WORKERS: usize = 5;

/// Literal replies and tokens exchanged on the wire.
pub mod reply {
    pub const READY: &str = "READY";
    pub const UPLOAD_OK: &str = "Upload OK";
    pub const FILE_NOT_FOUND: &str = "File not found";
    pub const NO_FILES: &str = "No files available.";
    pub const NO_FILENAME: &str = "No filename provided";
    pub const INVALID_FILENAME: &str = "Invalid filename";
    pub const INVALID_COMMAND: &str = "Invalid command";
    pub const UNKNOWN_COMMAND: &str = "Unknown command";
}

/// Timeouts applied to every socket operation of a connection.
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    /// Maximum time a single read may block.
    pub read_timeout: Duration,
    /// Maximum time a single write may block.
    pub write_timeout: Duration,
    /// Maximum time to wait for the command line of a fresh connection.
    pub idle_timeout: Duration,
}

impl TimeoutOptions {
    /// Use the same limit for every operation.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            read_timeout: timeout,
            write_timeout: timeout,
            idle_timeout: timeout,
        }
    }
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self::uniform(DEFAULT_TIMEOUT)
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when it is set; otherwise `default_level` applies to every target.
/// Output goes to stderr so stdout stays free for worker and session result channels.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
