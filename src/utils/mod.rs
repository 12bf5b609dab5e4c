//! Utility Functions
//!
//! Cross-cutting helpers used by the rest of the crate:
//!
//! 1. **Error Formatting** - startup failures rendered with troubleshooting hints
//! 2. **Retry Policy** - bounded exponential backoff with jitter and
//!    retryable-error classification
//!
//! ```no_run
//! use vigil_server::utils::RetryPolicy;
//!
//! # async fn demo() -> std::io::Result<()> {
//! let policy = RetryPolicy::default();
//! policy
//!     .run("write segment", || tokio::fs::write("/tmp/seg", b"data"))
//!     .await
//! # }
//! ```

pub mod errors;
pub mod retry;

pub use errors::format_user_error;
pub use retry::{RetryPolicy, Retryable};
