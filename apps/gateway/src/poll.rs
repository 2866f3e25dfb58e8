use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut { attempts: u32 },
}

/// Calls `probe` immediately and then every `interval` until it yields a value
/// or `budget` has elapsed. The last probe runs at the deadline. Probe errors
/// end the loop.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    budget: Duration,
    mut probe: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + budget;
    let mut attempts = 0_u32;
    loop {
        attempts = attempts.saturating_add(1);
        if let Some(value) = probe().await? {
            return Ok(PollOutcome::Ready(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut { attempts });
        }
        sleep(interval.min(deadline - now)).await;
    }
}
