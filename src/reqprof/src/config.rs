use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::profiler::{AnalysisMode, CacheMissHeuristics};

pub const DEFAULT_SAVE_PATH: &str = "./flamegraphs";
pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 50;
pub const DEFAULT_SAMPLING_DURATION_MS: u64 = 1000;
pub const DEFAULT_MIN_SAMPLES: u64 = 10;
pub const DEFAULT_MAX_STACK_DEPTH: usize = 50;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Html,
    Svg,
    Json,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "html" => Some(Self::Html),
            "svg" => Some(Self::Svg),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Svg => "svg",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Profiler settings as they arrive from the host application (JSON,
/// camelCase keys, every field optional).
///
/// Enumerated settings are kept as strings here so that a typo degrades to the
/// default with a warning instead of rejecting the whole document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfilerParams {
    pub enabled: bool,
    pub save_path: String,
    pub sampling_interval_ms: u64,
    pub sampling_duration_ms: u64,
    pub format: String,
    pub analysis_mode: String,
    pub min_samples: u64,
    pub max_stack_depth: usize,
    pub cache_miss_patterns: CacheMissHeuristics,
}

impl Default for ProfilerParams {
    fn default() -> Self {
        Self {
            enabled: false,
            save_path: DEFAULT_SAVE_PATH.to_string(),
            sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
            sampling_duration_ms: DEFAULT_SAMPLING_DURATION_MS,
            format: OutputFormat::Html.to_string(),
            analysis_mode: AnalysisMode::Cpu.as_str().to_string(),
            min_samples: DEFAULT_MIN_SAMPLES,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            cache_miss_patterns: CacheMissHeuristics::default(),
        }
    }
}

impl ProfilerParams {
    /// Correct out-of-range or unknown values to their defaults.
    pub fn validate(self) -> ProfilerConfig {
        let sampling_duration_ms = match self.sampling_duration_ms {
            0 => DEFAULT_SAMPLING_DURATION_MS,
            ms => ms,
        };
        let mut sampling_interval_ms = match self.sampling_interval_ms {
            0 => DEFAULT_SAMPLING_INTERVAL_MS,
            ms => ms,
        };
        if sampling_interval_ms >= sampling_duration_ms {
            // at least two ticks per session
            sampling_interval_ms = (sampling_duration_ms / 2).max(1);
        }

        let format = OutputFormat::parse(&self.format).unwrap_or_else(|| {
            warn!(format = %self.format, "invalid flame graph format, using html");
            OutputFormat::Html
        });
        let analysis_mode = AnalysisMode::parse(&self.analysis_mode).unwrap_or_else(|| {
            warn!(mode = %self.analysis_mode, "invalid analysis mode, using CPU");
            AnalysisMode::Cpu
        });

        let save_path = match self.save_path.trim() {
            "" => PathBuf::from(DEFAULT_SAVE_PATH),
            path => PathBuf::from(path),
        };
        let max_stack_depth = match self.max_stack_depth {
            0 => DEFAULT_MAX_STACK_DEPTH,
            depth => depth,
        };

        ProfilerConfig {
            enabled: self.enabled,
            save_path,
            sampling_interval: Duration::from_millis(sampling_interval_ms),
            sampling_duration: Duration::from_millis(sampling_duration_ms),
            format,
            analysis_mode,
            min_samples: self.min_samples,
            max_stack_depth,
            cache_miss: self.cache_miss_patterns,
        }
    }
}

/// Validated profiler configuration. Built once at startup.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub enabled: bool,
    pub save_path: PathBuf,
    pub sampling_interval: Duration,
    /// A session stops sampling on its own once it has run this long.
    pub sampling_duration: Duration,
    pub format: OutputFormat,
    pub analysis_mode: AnalysisMode,
    /// Folded stacks seen fewer times than this are left out of reports.
    pub min_samples: u64,
    pub max_stack_depth: usize,
    pub cache_miss: CacheMissHeuristics,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerParams::default().validate()
    }
}

impl ProfilerConfig {
    pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
        let params: ProfilerParams = serde_json::from_slice(json)?;
        Ok(params.validate())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}
