use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use sched::Scheduler;
use session::ProfilingSession;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::{
    config::ProfilerConfig,
    report::{ReportRequest, ReportWriter},
};

mod frame;
mod sampler;
mod sched;
mod session;
mod spans;
mod thread;

pub use frame::{folded_key, frame_label, parse_mode_tag, MODE_TAG_SEPARATOR};
pub use sampler::{AnalysisMode, CacheMissHeuristics, Sampler, SamplerOptions, TickStats};
pub use spans::{mark_background, SpanStackLayer, LOCK_WAIT_FIELD};
pub use thread::{
    CaptureError, RawFrame, StaticThreads, ThreadSnapshot, ThreadSnapshotProvider, ThreadState,
};

/// Threads whose name contains this are never sampled.
pub const PROFILER_THREAD_TAG: &str = "reqprof";

/// How long `stop_profiling` waits for an in-flight tick before reading the
/// table. A tick slower than this may still land after the snapshot and is
/// lost.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub ticks: u64,
    pub total_samples: u64,
    pub distinct_stacks: usize,
}

struct ActiveSession {
    session: Arc<ProfilingSession>,
    task: AbortHandle,
}

/// Registry of profiling sessions keyed by correlation id.
///
/// All methods take `&self` and are safe to call from any thread. Neither
/// starting nor stopping a session ever fails from the caller's point of view:
/// problems are logged and turn into no-ops or a `None` report.
pub struct Profiler {
    config: ProfilerConfig,
    provider: Arc<dyn ThreadSnapshotProvider>,
    sampler: Arc<Sampler>,
    writer: ReportWriter,

    // None when profiling can't run at all
    scheduler: Option<Scheduler>,
    sessions: DashMap<String, ActiveSession>,
    shut_down: AtomicBool,
    unsupported_logged: AtomicBool,
}

impl Profiler {
    pub fn new(
        config: ProfilerConfig,
        provider: Arc<dyn ThreadSnapshotProvider>,
    ) -> anyhow::Result<Self> {
        let sampler = Sampler::new(
            config.analysis_mode,
            config.cache_miss.clone(),
            SamplerOptions {
                max_stack_depth: config.max_stack_depth,
                ..Default::default()
            },
        );
        let writer = ReportWriter::new(config.save_path.clone(), config.format, config.min_samples);

        let scheduler = if config.enabled && provider.thread_timing_supported() {
            Some(Scheduler::new()?)
        } else {
            None
        };

        if config.enabled {
            info!(
                mode = %config.analysis_mode,
                format = %config.format,
                interval = ?config.sampling_interval,
                duration = ?config.sampling_duration,
                path = %config.save_path.display(),
                "profiler ready"
            );
        }

        Ok(Self {
            config,
            provider,
            sampler: Arc::new(sampler),
            writer,
            scheduler,
            sessions: DashMap::new(),
            shut_down: AtomicBool::new(false),
            unsupported_logged: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Begin sampling for `correlation_id`. Does nothing if profiling is
    /// disabled or unsupported, after shutdown, or if a session for this id is
    /// already running.
    pub fn start_profiling(&self, correlation_id: &str, label: Option<&str>) {
        self.try_start(correlation_id, label);
    }

    /// Returns whether a new session was started.
    pub(crate) fn try_start(&self, correlation_id: &str, label: Option<&str>) -> bool {
        if !self.config.enabled {
            debug!(correlation_id, "profiling disabled");
            return false;
        }
        if self.shut_down.load(Ordering::Acquire) {
            debug!(correlation_id, "profiler shut down, not starting session");
            return false;
        }
        let Some(scheduler) = &self.scheduler else {
            if !self.unsupported_logged.swap(true, Ordering::Relaxed) {
                warn!("per-thread CPU time not available, profiling disabled");
            }
            return false;
        };

        let slot = match self.sessions.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => {
                warn!(correlation_id, "profiling session already active");
                return false;
            }
            Entry::Vacant(slot) => slot,
        };

        let session = Arc::new(ProfilingSession::new(
            correlation_id.to_string(),
            label.map(String::from),
            self.config.analysis_mode,
            self.config.sampling_interval,
            self.config.sampling_duration,
        ));

        let tick_session = session.clone();
        let sampler = self.sampler.clone();
        let provider = self.provider.clone();
        let Some(task) = scheduler.spawn_periodic(session.interval(), move || {
            tick_session.tick(&sampler, provider.as_ref())
        }) else {
            debug!(correlation_id, "scheduler stopped, not starting session");
            return false;
        };

        slot.insert(ActiveSession { session, task });
        info!(correlation_id, label, "profiling started");
        true
    }

    /// End the session for `correlation_id` and write its report.
    ///
    /// Returns the report path, the raw dump path if rendering failed, or
    /// `None` if there was no session or nothing reached the sample threshold.
    pub fn stop_profiling(&self, correlation_id: &str) -> Option<PathBuf> {
        let (_, active) = self.sessions.remove(correlation_id)?;
        let session = active.session;

        session.stop();
        active.task.abort();
        std::thread::sleep(STOP_GRACE_PERIOD);

        let stacks = session.stacks().snapshot();
        info!(
            correlation_id,
            ticks = session.ticks(),
            samples = stacks.total_samples(),
            stacks = stacks.len(),
            elapsed = ?session.elapsed(),
            "profiling stopped"
        );

        let path = self.writer.write(ReportRequest {
            correlation_id,
            label: session.label(),
            mode: session.mode(),
            stacks,
        });
        match &path {
            Some(path) => info!(correlation_id, path = %path.display(), "flame graph written"),
            None => debug!(correlation_id, "no flame graph written"),
        }
        path
    }

    /// Stop every session and the scheduler, waiting at most `timeout` for
    /// in-flight ticks. Sessions are discarded without reports.
    pub fn shutdown(&self, timeout: Duration) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let ids = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        for id in ids {
            if let Some((_, active)) = self.sessions.remove(&id) {
                active.session.stop();
                active.task.abort();
            }
        }

        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown(timeout);
        }
        info!("profiler shut down");
    }

    pub fn is_active(&self, correlation_id: &str) -> bool {
        self.sessions.contains_key(correlation_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_stats(&self, correlation_id: &str) -> Option<SessionStats> {
        let active = self.sessions.get(correlation_id)?;
        let stacks = active.session.stacks();
        Some(SessionStats {
            ticks: active.session.ticks(),
            total_samples: stacks.total(),
            distinct_stacks: stacks.len(),
        })
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) && !self.sessions.is_empty() {
            warn!(
                sessions = self.sessions.len(),
                "profiler dropped with active sessions"
            );
        }
        // scheduler drop does a non-blocking shutdown
        for entry in self.sessions.iter() {
            entry.session.stop();
            entry.task.abort();
        }
    }
}
