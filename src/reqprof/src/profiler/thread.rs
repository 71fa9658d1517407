use thiserror::Error;

/// One captured frame, before formatting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawFrame {
    /// Module path or type that declares the function.
    pub declaring: String,
    pub member: String,
    pub line: Option<u32>,
}

impl RawFrame {
    pub fn new(declaring: impl Into<String>, member: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            declaring: declaring.into(),
            member: member.into(),
            line,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Running,
    /// Waiting to acquire a lock.
    Blocked,
    /// Alive, but nothing on its stack.
    Idle,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("thread exited")]
    ThreadExited,
    #[error("stack unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub name: String,
    /// Service threads that never run request work (the sampler's own
    /// workers, runtime housekeeping).
    pub background: bool,
    pub state: ThreadState,
    /// Innermost frame first.
    pub stack: Result<Vec<RawFrame>, CaptureError>,
}

impl ThreadSnapshot {
    pub fn running(name: impl Into<String>, stack: Vec<RawFrame>) -> Self {
        Self {
            name: name.into(),
            background: false,
            state: ThreadState::Running,
            stack: Ok(stack),
        }
    }

    pub fn blocked(name: impl Into<String>, stack: Vec<RawFrame>) -> Self {
        Self {
            state: ThreadState::Blocked,
            ..Self::running(name, stack)
        }
    }
}

/// Source of live thread stacks for the sampler.
pub trait ThreadSnapshotProvider: Send + Sync {
    fn threads(&self) -> anyhow::Result<Vec<ThreadSnapshot>>;

    /// Number of innermost frames on every captured stack that belong to the
    /// capture machinery itself and must not be counted.
    fn capture_overhead_frames(&self) -> usize {
        0
    }

    /// Whether the platform can report per-thread CPU time. Profiling is
    /// disabled when it can't.
    fn thread_timing_supported(&self) -> bool {
        thread_cpu_clock_available()
    }
}

#[cfg(unix)]
pub fn thread_cpu_clock_available() -> bool {
    use nix::time::{clock_gettime, ClockId};

    clock_gettime(ClockId::CLOCK_THREAD_CPUTIME_ID).is_ok()
}

#[cfg(not(unix))]
pub fn thread_cpu_clock_available() -> bool {
    false
}

/// Fixed set of thread snapshots, returned on every call.
///
/// Used to replay captured stacks and to drive the sampler in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticThreads {
    pub threads: Vec<ThreadSnapshot>,
    pub overhead_frames: usize,
    pub timing_unsupported: bool,
}

impl StaticThreads {
    pub fn new(threads: Vec<ThreadSnapshot>) -> Self {
        Self {
            threads,
            ..Default::default()
        }
    }
}

impl ThreadSnapshotProvider for StaticThreads {
    fn threads(&self) -> anyhow::Result<Vec<ThreadSnapshot>> {
        Ok(self.threads.clone())
    }

    fn capture_overhead_frames(&self) -> usize {
        self.overhead_frames
    }

    fn thread_timing_supported(&self) -> bool {
        !self.timing_unsupported
    }
}
