//! Request-scoped sampling profiler.
//!
//! A [`Profiler`] runs one sampling session per tracked unit of work (an API
//! call, a job, a request), keyed by a caller-supplied correlation id. While a
//! session is active, a periodic tick snapshots the stacks of all live threads
//! and folds them into a frequency table. Stopping the session renders that
//! table as a flame graph: an interactive HTML report, a static SVG, or a
//! structured JSON export, next to a raw folded-stack dump.
//!
//! Stacks come from a [`ThreadSnapshotProvider`]. The bundled
//! [`SpanStackLayer`] is a `tracing-subscriber` layer that treats each thread's
//! stack of entered spans as its call stack.
//!
//! Profiling is best-effort: nothing in [`Profiler::start_profiling`] or
//! [`Profiler::stop_profiling`] panics or returns an error to the caller.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub mod config;
pub mod hierarchy;
pub mod instrument;
pub mod profiler;
pub mod report;
pub mod stacks;

pub use config::{ConfigError, OutputFormat, ProfilerConfig, ProfilerParams};
pub use hierarchy::{FrameHierarchy, FrameNode};
pub use instrument::ProfileGuard;
pub use profiler::{
    AnalysisMode, CacheMissHeuristics, Profiler, SessionStats, SpanStackLayer, ThreadSnapshot,
    ThreadSnapshotProvider, ThreadState,
};
pub use stacks::{FoldedStacks, StackAggregator};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter()).try_init();
    });
}

/// Like [`init_logging`], but also registers `layer` so that spans entered on
/// any thread become visible to the profiler.
///
/// The `RUST_LOG` filter only applies to log output; the span layer sees every
/// span.
pub fn init_logging_with(layer: SpanStackLayer) {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(layer)
            .with(fmt::layer().with_filter(env_filter()))
            .try_init();
    });
}
