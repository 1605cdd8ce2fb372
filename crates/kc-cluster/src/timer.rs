//! Named periodic tasks.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Runs named tasks on a fixed period.
///
/// Scheduling a name again replaces the previous task. The first run happens
/// one period after scheduling.
#[derive(Debug, Default)]
pub struct TimerProvider {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TimerProvider {
    /// Creates a timer with no tasks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` every `period` under `name`.
    ///
    /// Must be called within a tokio runtime.
    pub fn schedule<F, Fut>(&self, name: impl Into<String>, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let period = period.max(Duration::from_millis(1));
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                tracing::trace!(task = %task_name, "Running timer task");
                task().await;
            }
        });
        if let Some(previous) = self.tasks.lock().insert(name.clone(), handle) {
            previous.abort();
        }
        tracing::debug!(task = %name, period_ms = period.as_millis(), "Scheduled timer task");
    }

    /// Stops the task called `name`. Returns whether it existed.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                tracing::debug!(task = name, "Cancelled timer task");
                true
            }
            None => false,
        }
    }

    /// Whether a task called `name` is scheduled.
    #[must_use]
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks.lock().contains_key(name)
    }

    /// Names of every scheduled task, sorted.
    #[must_use]
    pub fn scheduled(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops every task.
    pub fn cancel_all(&self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerProvider {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.get_mut().drain() {
            handle.abort();
        }
    }
}
