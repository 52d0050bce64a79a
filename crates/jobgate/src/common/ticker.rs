use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs `tick` every `period` until `stop` is cancelled.
///
/// Ticks never overlap: a tick that takes longer than `period` causes the missed ticks to be
/// skipped. Errors are logged and the loop continues with the next tick.
pub async fn run_periodically<F, Fut>(
    name: &'static str,
    period: Duration,
    stop: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                log::debug!("Running periodic task {name}");
                if let Err(error) = tick().await {
                    log::error!("Periodic task {name} failed: {error:?}");
                }
            }
        }
    }
    log::debug!("Periodic task {name} stopped");
}

#[cfg(test)]
mod tests {
    use super::run_periodically;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn keeps_ticking_after_failure() {
        let count = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();
        let handle = {
            let count = count.clone();
            let stop = stop.clone();
            tokio::spawn(run_periodically(
                "test",
                Duration::from_millis(5),
                stop,
                move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("failure")
                    }
                },
            ))
        };
        while count.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ticks_do_not_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();
        let handle = {
            let running = running.clone();
            let finished = finished.clone();
            tokio::spawn(run_periodically(
                "slow",
                Duration::from_millis(1),
                stop.clone(),
                move || {
                    let running = running.clone();
                    let finished = finished.clone();
                    async move {
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            ))
        };
        while finished.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.cancel();
        handle.await.unwrap();
    }
}
