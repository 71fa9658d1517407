use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{
    frame::folded_key,
    thread::{RawFrame, ThreadSnapshotProvider, ThreadState},
    PROFILER_THREAD_TAG,
};
use crate::{config::DEFAULT_MAX_STACK_DEPTH, stacks::StackAggregator};

/// Which threads a tick counts, and how heavily.
///
/// None of these read hardware counters. They are wall-clock stack snapshots
/// filtered and weighted by heuristics, and the reports label them as such.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisMode {
    /// Every live thread, weight 1. A coarse proxy for CPU activity.
    #[default]
    Cpu,
    /// Same capture as `Cpu` under its own key prefix.
    Alloc,
    /// Only threads blocked on a lock, weight 3.
    Lock,
    /// Only stacks touching memory-heavy code (see [`CacheMissHeuristics`]),
    /// weight 2.
    CacheMisses,
}

impl AnalysisMode {
    pub const ALL: [AnalysisMode; 4] = [Self::Cpu, Self::Alloc, Self::Lock, Self::CacheMisses];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Alloc => "ALLOC",
            Self::Lock => "LOCK",
            Self::CacheMisses => "CACHE_MISSES",
        }
    }

    /// Key prefix. CPU is the default lens and goes untagged.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            Self::Cpu => None,
            mode => Some(mode.as_str()),
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_str() == tag)
    }

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::from_tag(&normalized)
    }

    pub fn weight(&self) -> u64 {
        match self {
            Self::Cpu | Self::Alloc => 1,
            Self::Lock => 3,
            Self::CacheMisses => 2,
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substring patterns marking a frame as memory-access heavy for
/// [`AnalysisMode::CacheMisses`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheMissHeuristics {
    /// Matched against the function name.
    pub member_patterns: Vec<String>,
    /// Matched against the declaring module or type.
    pub type_patterns: Vec<String>,
}

impl Default for CacheMissHeuristics {
    fn default() -> Self {
        Self {
            member_patterns: ["hash", "clone", "extend", "resize", "to_vec"]
                .map(String::from)
                .to_vec(),
            type_patterns: [
                "std::collections",
                "hashbrown",
                "alloc::vec",
                "std::io",
                "bytes",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

impl CacheMissHeuristics {
    pub fn matches(&self, frame: &RawFrame) -> bool {
        self.member_patterns
            .iter()
            .any(|p| frame.member.contains(p.as_str()))
            || self
                .type_patterns
                .iter()
                .any(|p| frame.declaring.contains(p.as_str()))
    }

    pub fn matches_any(&self, frames: &[RawFrame]) -> bool {
        frames.iter().any(|frame| self.matches(frame))
    }
}

#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub max_stack_depth: usize,
    /// Threads with fewer frames than this (after dropping capture overhead)
    /// are skipped.
    pub min_stack_depth: usize,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            min_stack_depth: 1,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub threads_seen: usize,
    pub threads_sampled: usize,
    pub threads_failed: usize,
}

pub struct Sampler {
    mode: AnalysisMode,
    heuristics: CacheMissHeuristics,
    options: SamplerOptions,
}

impl Sampler {
    pub fn new(mode: AnalysisMode, heuristics: CacheMissHeuristics, options: SamplerOptions) -> Self {
        Self {
            mode,
            heuristics,
            options,
        }
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    /// Take one snapshot of every thread and fold the qualifying stacks into
    /// `stacks`.
    ///
    /// A thread whose stack can't be read is skipped for this tick only; only
    /// failure to enumerate threads at all is an error.
    pub fn sample(
        &self,
        provider: &dyn ThreadSnapshotProvider,
        stacks: &StackAggregator,
    ) -> anyhow::Result<TickStats> {
        let overhead = provider.capture_overhead_frames();
        let mut stats = TickStats::default();

        for thread in provider.threads()? {
            if thread.background || thread.name.contains(PROFILER_THREAD_TAG) {
                continue;
            }
            stats.threads_seen += 1;

            if self.mode == AnalysisMode::Lock && thread.state != ThreadState::Blocked {
                continue;
            }

            let stack = match thread.stack {
                Ok(stack) => stack,
                Err(e) => {
                    trace!(thread = %thread.name, "skipping thread: {e}");
                    stats.threads_failed += 1;
                    continue;
                }
            };

            let frames = stack.get(overhead..).unwrap_or_default();
            if frames.is_empty() || frames.len() < self.options.min_stack_depth {
                continue;
            }

            if self.mode == AnalysisMode::CacheMisses && !self.heuristics.matches_any(frames) {
                continue;
            }

            let key = folded_key(&thread.name, self.mode, frames, self.options.max_stack_depth);
            stacks.add(key, self.mode.weight());
            stats.threads_sampled += 1;
        }

        Ok(stats)
    }
}
