use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tessera_core::panic_payload_to_string;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a supervised background task ended. Only useful for tests and diagnostics; callers are
/// never expected to act on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisedOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    DeadlineExceeded,
    Cancelled,
}

/// Spawn best-effort work that must never take the caller down.
///
/// The task receives a child of `parent`, which is cancelled when `deadline` elapses or `parent`
/// is cancelled. Errors and panics are logged at `warn`/`error` and otherwise swallowed.
pub fn spawn_supervised<F, Fut, E>(
    name: &'static str,
    deadline: Duration,
    parent: &CancellationToken,
    f: F,
) -> JoinHandle<SupervisedOutcome>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let token = parent.child_token();
    let fut = f(token.clone());

    tokio::spawn(async move {
        let guarded = tokio::time::timeout(deadline, AssertUnwindSafe(fut).catch_unwind());
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => SupervisedOutcome::Cancelled,
            result = guarded => match result {
                Ok(Ok(Ok(()))) => SupervisedOutcome::Completed,
                Ok(Ok(Err(err))) => SupervisedOutcome::Failed(err.to_string()),
                Ok(Err(payload)) => SupervisedOutcome::Panicked(panic_payload_to_string(payload.as_ref())),
                Err(_elapsed) => SupervisedOutcome::DeadlineExceeded,
            },
        };
        token.cancel();

        match &outcome {
            SupervisedOutcome::Completed => {
                tracing::debug!(target: "tessera.scheduler", task = name, "background task finished");
            }
            SupervisedOutcome::Cancelled => {
                tracing::debug!(target: "tessera.scheduler", task = name, "background task cancelled");
            }
            SupervisedOutcome::Failed(err) => {
                tracing::warn!(target: "tessera.scheduler", task = name, error = %err, "background task failed");
            }
            SupervisedOutcome::Panicked(message) => {
                tracing::error!(target: "tessera.scheduler", task = name, panic = %message, "background task panicked");
            }
            SupervisedOutcome::DeadlineExceeded => {
                tracing::warn!(
                    target: "tessera.scheduler",
                    task = name,
                    deadline_ms = deadline.as_millis() as u64,
                    "background task exceeded its deadline"
                );
            }
        }
        outcome
    })
}
