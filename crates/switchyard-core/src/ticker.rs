use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs `tick` every `period` until `shutdown` is cancelled.
///
/// The first tick fires immediately. Each tick runs on its own task and is
/// awaited before the next one, so ticks never overlap and a panicking tick
/// is logged without stopping the loop. Missed ticks are delayed, not burst.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(
            loop_name = name,
            period_ms = period.as_millis() as u64,
            "Periodic loop started",
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = tokio::spawn(tick()).await {
                tracing::error!(loop_name = name, error = %e, "Periodic tick panicked");
            }
        }

        tracing::debug!(loop_name = name, "Periodic loop stopped");
    })
}
