//! Taxaline Core - shared infrastructure for the biodiversity archive pipeline
//!
//! HTTP transfers with stall detection, the closed error taxonomy, retry,
//! bounded fan-out, worker queues, shutdown handling, logging and progress.

pub mod error;
pub mod logging;
pub mod progress;
pub mod retry;
pub mod semaphore;
pub mod shutdown;
pub mod stream;
pub mod work_queue;

// Re-exports for convenience
pub use error::{ErrorCategory, categorize_io, categorize_message};
pub use logging::init_logging;
pub use progress::{ProgressContext, fmt_num};
pub use retry::retry_with_backoff;
pub use semaphore::Semaphore;
pub use shutdown::{install_signal_handlers, is_shutdown_requested, request_shutdown};
pub use stream::{
    DownloadStats, HttpConfig, SHARED_RUNTIME, StreamError, download_to_file, fetch_text,
    http_client, http_config, set_http_config,
};
pub use work_queue::WorkQueue;
