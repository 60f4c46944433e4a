use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A task body driven on a cadence by one of the drivers below.
#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync + 'static {
    async fn run_once(&self);
    async fn before_shutdown_complete(&self) {}
}

/// Run `run_once` so that consecutive starts are `interval` apart, however
/// long each pass takes. A shutdown notification is honoured between
/// passes; a pass already underway runs to completion.
pub(crate) async fn run_at_fixed_interval<T: PeriodicRunnable>(
    runnable: Arc<T>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    loop {
        let stop = shutdown.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        let pass_started = Instant::now();
        runnable.run_once().await;

        let wait = interval.saturating_sub(pass_started.elapsed());
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    runnable.before_shutdown_complete().await;
}

/// Run `run_once` with a fixed pause of `delay` between the end of one pass
/// and the start of the next.
pub(crate) async fn run_with_fixed_delay<T: PeriodicRunnable>(
    runnable: Arc<T>,
    delay: Duration,
    shutdown: Arc<Notify>,
) {
    loop {
        let stop = shutdown.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        runnable.run_once().await;

        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    runnable.before_shutdown_complete().await;
}
