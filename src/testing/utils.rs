use crate::types::{EntityId, EntityKind};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Wait for a condition with timeout
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    condition()
}

/// Repeat `action` until its output satisfies `predicate`, or give up.
pub(crate) async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        sleep(interval).await;
    }
    None
}

/// `count` distinct user ids.
pub(crate) fn user_ids(count: usize) -> Vec<EntityId> {
    (0..count)
        .map(|i| EntityId::of(EntityKind::User, i.to_string()))
        .collect()
}
