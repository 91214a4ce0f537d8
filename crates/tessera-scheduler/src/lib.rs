//! Cooperative cancellation and bounded task execution.
//!
//! - [`CancellationRegistry`] maps in-flight request ids to cancellation tokens.
//! - [`spawn_supervised`] runs best-effort background work with a deadline; failures are logged,
//!   never returned.
//! - [`for_each_bounded`] fans work out over a fixed number of worker tasks.

mod cancellation;
mod pool;
mod supervise;

pub use cancellation::{CancelGuard, CancellationRegistry};
pub use pool::for_each_bounded;
pub use supervise::{spawn_supervised, SupervisedOutcome};
pub use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
}
