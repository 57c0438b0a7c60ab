use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A background job that runs a closure at a fixed period on the tokio runtime.
///
/// The first run happens one `period` after the task was spawned. The job is aborted
/// when [`stop`](Self::stop) is called or the task handle is dropped.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns `job` on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime, or if `period` is zero.
    pub fn spawn<F>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        assert!(!period.is_zero(), "period of task `{name}` must be non-zero");

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                tracing::trace!(task = name, "Running periodic task");
                job();
            }
        });

        tracing::debug!(
            task = name,
            period = %humantime::format_duration(period),
            "Started periodic task"
        );
        Self { name, handle }
    }

    /// Whether the job is still scheduled.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the job. A run that is currently executing is not interrupted.
    pub fn stop(self) {
        // dropping aborts
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            tracing::debug!(task = self.name, "Stopping periodic task");
        }
        self.handle.abort();
    }
}
