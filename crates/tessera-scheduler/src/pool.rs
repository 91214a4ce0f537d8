use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_core::panic_payload_to_string;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::TaskError;

/// Run `f` over every item using exactly `min(workers, items.len())` concurrent tasks.
///
/// Workers pull from a shared queue, so a slow item never holds up the others. Items not yet
/// started when `token` is cancelled are skipped and the call returns [`TaskError::Cancelled`].
/// A panicking item aborts the remaining workers.
pub async fn for_each_bounded<I, F, Fut>(
    items: Vec<I>,
    workers: usize,
    token: &CancellationToken,
    f: F,
) -> Result<(), TaskError>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if items.is_empty() {
        return Ok(());
    }
    let workers = workers.max(1).min(items.len());
    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let f = Arc::new(f);

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let queue = queue.clone();
        let f = f.clone();
        let token = token.clone();
        set.spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                // The queue lock is never held across an await.
                let Some(item) = queue.lock().pop_front() else {
                    break;
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = f(item) => {}
                }
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                let message = panic_payload_to_string(err.into_panic().as_ref());
                tracing::error!(target: "tessera.scheduler", panic = %message, "pool worker panicked");
                set.abort_all();
                return Err(TaskError::Panicked(message));
            }
        }
    }

    if token.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    Ok(())
}
