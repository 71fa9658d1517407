use std::{ops::ControlFlow, thread::available_parallelism, time::Duration};

use parking_lot::Mutex;
use tokio::{
    runtime::{Handle, Runtime},
    task::AbortHandle,
    time::MissedTickBehavior,
};
use tracing::debug;

use super::{spans, PROFILER_THREAD_TAG};

/// Shortest period a task may tick at.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Shared periodic-task scheduler. One repeating task per session.
pub struct Scheduler {
    rt: Mutex<Option<Runtime>>,
}

impl Scheduler {
    pub fn new() -> anyhow::Result<Self> {
        let workers = available_parallelism().map_or(2, |n| n.get()).max(2);
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(format!("{PROFILER_THREAD_TAG}-sampler"))
            .on_thread_start(spans::mark_background)
            .enable_time()
            .build()?;

        Ok(Self {
            rt: Mutex::new(Some(rt)),
        })
    }

    /// Run `tick` every `interval` until it breaks or the task is aborted.
    /// The first tick fires immediately. Returns `None` after shutdown.
    pub fn spawn_periodic<F>(&self, interval: Duration, mut tick: F) -> Option<AbortHandle>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let rt = self.rt.lock();
        let rt = rt.as_ref()?;

        // a zero period would panic inside the task
        let interval = interval.max(MIN_TICK_INTERVAL);

        let task = rt.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tick().is_break() {
                    break;
                }
            }
        });
        Some(task.abort_handle())
    }

    #[cfg(test)]
    fn is_shut_down(&self) -> bool {
        self.rt.lock().is_none()
    }

    /// Stop all workers, waiting at most `timeout` for running ticks. Safe to
    /// call more than once.
    pub fn shutdown(&self, timeout: Duration) {
        let Some(rt) = self.rt.lock().take() else {
            return;
        };

        // blocking shutdown panics inside an async context
        if Handle::try_current().is_ok() {
            rt.shutdown_background();
        } else {
            rt.shutdown_timeout(timeout);
        }
        debug!("sampler scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(rt) = self.rt.get_mut().take() {
            rt.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn periodic_task_runs_until_break() {
        let sched = Scheduler::new().unwrap();
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        sched
            .spawn_periodic(Duration::from_millis(1), move || {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        sched.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn zero_interval_still_ticks() {
        let sched = Scheduler::new().unwrap();
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        sched
            .spawn_periodic(Duration::ZERO, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(runs.load(Ordering::SeqCst) >= 2);
        sched.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn refuses_work_after_shutdown() {
        let sched = Scheduler::new().unwrap();
        sched.shutdown(Duration::from_secs(1));
        sched.shutdown(Duration::from_secs(1));

        assert!(sched.is_shut_down());
        assert!(sched
            .spawn_periodic(Duration::from_millis(1), || ControlFlow::Continue(()))
            .is_none());
    }
}
