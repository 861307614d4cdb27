//! Bounded fan-out of independent async jobs.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Run `job` over every item with at most `workers` in flight at once.
///
/// Results come back in input order, never completion order. A job that
/// panics is dropped from the output and logged; the rest still complete.
pub async fn bounded<T, R, F, Fut>(items: Vec<T>, workers: usize, job: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let fut = job(item);
        set.spawn(async move {
            // The semaphore is never closed, so acquire only fails if it is.
            let _permit = semaphore.acquire_owned().await;
            (index, fut.await)
        });
    }

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(e) => tracing::warn!(target: "pool", "worker failed: {e}"),
        }
    }

    slots.into_iter().flatten().collect()
}
