use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A repeating background task with fixed-period ticks.
///
/// The first tick fires one period after spawn. A tick that fails or panics
/// is logged and the schedule carries on. `stop()` lets an in-flight tick
/// finish and can be called any number of times.
pub struct ScheduledTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    /// Spawns `tick` on the current tokio runtime every `period`.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        // Run the tick as its own task so a panic is contained.
                        match tokio::spawn(tick()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::error!(task = name, error = %e, "scheduled task failed");
                            }
                            Err(e) => {
                                tracing::error!(task = name, error = %e, "scheduled task panicked");
                            }
                        }
                    }
                }
            }

            tracing::debug!(task = name, "scheduled task stopped");
        });

        tracing::debug!(task = name, period = ?period, "scheduled task started");

        Self {
            name,
            cancel,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancels future ticks and waits for the task to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(task = self.name, error = %e, "scheduled task join failed");
            }
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::bail;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_each_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&ticks);

        let task = ScheduledTask::spawn("test", Duration::from_secs(1), move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.stop().await;
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_cancel_schedule() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&ticks);

        let task = ScheduledTask::spawn("failing", Duration::from_secs(1), move || {
            let counted = Arc::clone(&counted);
            async move {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    bail!("sink unavailable");
                }
                if n == 1 {
                    panic!("sink exploded");
                }
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let task = ScheduledTask::spawn("idle", Duration::from_secs(1), || async { Ok(()) });
        task.stop().await;
        task.stop().await;
        assert!(!task.is_running());
    }
}
