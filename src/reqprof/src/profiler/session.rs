use std::{
    ops::ControlFlow,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tracing::{debug, error, trace};

use super::{
    sampler::Sampler,
    thread::ThreadSnapshotProvider,
    AnalysisMode,
};
use crate::stacks::StackAggregator;

/// One bounded profiling run for one correlation id.
///
/// Only the session's own ticks write to its table, and the scheduler never
/// runs two ticks of the same session at once.
pub struct ProfilingSession {
    correlation_id: String,
    label: Option<String>,
    mode: AnalysisMode,
    started_at: Instant,
    duration_limit: Duration,
    interval: Duration,

    running: AtomicBool,
    ticks: AtomicU64,
    stacks: StackAggregator,
}

impl ProfilingSession {
    pub fn new(
        correlation_id: String,
        label: Option<String>,
        mode: AnalysisMode,
        interval: Duration,
        duration_limit: Duration,
    ) -> Self {
        Self {
            correlation_id,
            label,
            mode,
            started_at: Instant::now(),
            duration_limit,
            interval,
            running: AtomicBool::new(true),
            ticks: AtomicU64::new(0),
            stacks: StackAggregator::new(),
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of ticks that actually sampled.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn stacks(&self) -> &StackAggregator {
        &self.stacks
    }

    /// Returns whether this call is the one that stopped the session.
    pub fn stop(&self) -> bool {
        self.running.swap(false, Ordering::AcqRel)
    }

    /// One scheduled tick. Breaks once the session is stopped or past its
    /// duration limit; a tick for an already-stopped session does nothing.
    pub fn tick(&self, sampler: &Sampler, provider: &dyn ThreadSnapshotProvider) -> ControlFlow<()> {
        if !self.is_running() {
            return ControlFlow::Break(());
        }

        if self.elapsed() > self.duration_limit {
            if self.stop() {
                debug!(
                    correlation_id = %self.correlation_id,
                    ticks = self.ticks(),
                    "sampling duration reached, session stopped itself"
                );
            }
            return ControlFlow::Break(());
        }

        // a panicking provider must not take the schedule down with it
        let result = panic::catch_unwind(AssertUnwindSafe(|| sampler.sample(provider, &self.stacks)));
        match result {
            Ok(Ok(stats)) => {
                self.ticks.fetch_add(1, Ordering::AcqRel);
                trace!(correlation_id = %self.correlation_id, ?stats, "tick");
            }
            Ok(Err(e)) => {
                error!(correlation_id = %self.correlation_id, "sampling tick failed: {e:#}");
            }
            Err(_) => {
                error!(correlation_id = %self.correlation_id, "sampling tick panicked");
            }
        }

        ControlFlow::Continue(())
    }
}
