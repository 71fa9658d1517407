//! Scoped profiling around a single call.

use std::path::PathBuf;

use uuid::Uuid;

use crate::profiler::Profiler;

/// Stops its session when dropped, even if the profiled code panics.
///
/// Only a guard that actually started a session stops one: a guard created
/// while another session holds the same id leaves that session alone.
#[must_use = "the session stops as soon as the guard is dropped"]
pub struct ProfileGuard<'a> {
    profiler: &'a Profiler,
    correlation_id: String,
    started: bool,
}

impl<'a> ProfileGuard<'a> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn is_profiling(&self) -> bool {
        self.started
    }

    /// Stop now and return the report path.
    pub fn finish(mut self) -> Option<PathBuf> {
        self.stop()
    }

    fn stop(&mut self) -> Option<PathBuf> {
        if !std::mem::take(&mut self.started) {
            return None;
        }
        self.profiler.stop_profiling(&self.correlation_id)
    }
}

impl Drop for ProfileGuard<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Profiler {
    pub fn guard(&self, correlation_id: impl Into<String>, label: Option<&str>) -> ProfileGuard<'_> {
        let correlation_id = correlation_id.into();
        let started = self.try_start(&correlation_id, label);
        ProfileGuard {
            profiler: self,
            correlation_id,
            started,
        }
    }

    /// Profile `f` under a fresh correlation id.
    pub fn profile_call<T>(&self, label: &str, f: impl FnOnce() -> T) -> (T, Option<PathBuf>) {
        let guard = self.guard(Uuid::new_v4().to_string(), Some(label));
        let value = f();
        (value, guard.finish())
    }
}
