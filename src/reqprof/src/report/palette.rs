use std::fmt;

use ahash::RandomState;

use crate::profiler::{parse_mode_tag, AnalysisMode};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FrameCategory {
    /// Thread root frame, colored by the mode its stacks were sampled in.
    Mode(AnalysisMode),
    Std,
    Runtime,
    Other,
}

const STD_PREFIXES: &[&str] = &["std::", "core::", "alloc::"];
const RUNTIME_PREFIXES: &[&str] = &[
    "tokio::",
    "futures::",
    "futures_util::",
    "mio::",
    "async_std::",
    "hyper::",
    "axum::",
    "tower::",
];

impl FrameCategory {
    pub fn of(label: &str, is_root: bool) -> Self {
        if is_root {
            return match parse_mode_tag(label) {
                Some((mode, _)) => Self::Mode(mode),
                None => Self::Mode(AnalysisMode::Cpu),
            };
        }

        let label = label.trim_start_matches('<');
        if STD_PREFIXES.iter().any(|p| label.starts_with(p)) {
            Self::Std
        } else if RUNTIME_PREFIXES.iter().any(|p| label.starts_with(p)) {
            Self::Runtime
        } else {
            Self::Other
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Mode(mode) => mode.as_str(),
            Self::Std => "std",
            Self::Runtime => "async runtime",
            Self::Other => "application",
        }
    }

    pub fn color(&self) -> Rgb {
        match self {
            Self::Mode(AnalysisMode::Cpu) => Rgb(0x4c, 0xaf, 0x50),
            Self::Mode(AnalysisMode::Alloc) => Rgb(0x21, 0x96, 0xf3),
            Self::Mode(AnalysisMode::Lock) => Rgb(0xe5, 0x39, 0x35),
            Self::Mode(AnalysisMode::CacheMisses) => Rgb(0xfd, 0xd8, 0x35),
            Self::Std => Rgb(0xf0, 0xa0, 0x40),
            Self::Runtime => Rgb(0x9c, 0x6a, 0xde),
            Self::Other => Rgb(0xe8, 0x6a, 0x3a),
        }
    }

    /// Every category, in legend order.
    pub fn legend() -> impl Iterator<Item = FrameCategory> {
        AnalysisMode::ALL
            .into_iter()
            .map(Self::Mode)
            .chain([Self::Std, Self::Runtime, Self::Other])
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Shift each channel by up to ±`spread`, derived from `key`, so that
    /// neighbouring frames of one category stay distinguishable. Same key,
    /// same color.
    pub fn jitter(self, key: &str, spread: u8) -> Rgb {
        if spread == 0 {
            return self;
        }

        let hash = RandomState::with_seeds(0x5eed, 0xf1a3, 0x9a7e, 0xc01d).hash_one(key);
        let range = 2 * spread as i16 + 1;
        let shift = |channel: u8, bits: u64| {
            let delta = (bits % range as u64) as i16 - spread as i16;
            (channel as i16 + delta).clamp(0, 255) as u8
        };
        Rgb(
            shift(self.0, hash),
            shift(self.1, hash >> 16),
            shift(self.2, hash >> 32),
        )
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_frames() {
        assert_eq!(FrameCategory::of("worker-1", true), FrameCategory::Mode(AnalysisMode::Cpu));
        assert_eq!(
            FrameCategory::of("LOCK|worker-1", true),
            FrameCategory::Mode(AnalysisMode::Lock)
        );
        assert_eq!(
            FrameCategory::of("std::collections::hash::map::insert", false),
            FrameCategory::Std
        );
        assert_eq!(FrameCategory::of("<alloc::vec::Vec<T>>::push", false), FrameCategory::Std);
        assert_eq!(FrameCategory::of("tokio::runtime::park", false), FrameCategory::Runtime);
        assert_eq!(FrameCategory::of("app::handler::index:12", false), FrameCategory::Other);
    }

    #[test]
    fn mode_colors_are_fixed() {
        assert_eq!(FrameCategory::Mode(AnalysisMode::Cpu).color().to_string(), "#4caf50");
        assert_eq!(FrameCategory::Mode(AnalysisMode::Lock).color().to_string(), "#e53935");
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let base = Rgb(100, 100, 100);
        let a = base.jitter("app::handler::index", 10);
        assert_eq!(a, base.jitter("app::handler::index", 10));
        for channel in [a.0, a.1, a.2] {
            assert!((90..=110).contains(&channel));
        }
        assert_eq!(base.jitter("x", 0), base);
    }
}
