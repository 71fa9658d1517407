//! Folded-stack frequency tables.
//!
//! A folded stack is one call stack serialized as `frame;frame;frame`, outermost
//! caller first. [`StackAggregator`] is the live, concurrently updated table
//! owned by a session; [`FoldedStacks`] is an immutable snapshot of it that the
//! report pipeline filters and renders.

use std::collections::{btree_map, BTreeMap};

use ahash::RandomState;
use dashmap::DashMap;
use thiserror::Error;

pub const FRAME_SEPARATOR: char = ';';

/// Live folded-stack table. Counts only ever grow.
#[derive(Debug, Default)]
pub struct StackAggregator {
    counts: DashMap<String, u64, RandomState>,
}

impl StackAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: String, weight: u64) {
        *self.counts.entry(key).or_insert(0) += weight;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|entry| *entry.value()).sum()
    }

    /// Copy the current contents out. Concurrent adds may or may not be
    /// included, but each key is read atomically.
    pub fn snapshot(&self) -> FoldedStacks {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: &'static str,
}

/// Immutable folded-stack table, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldedStacks {
    stacks: BTreeMap<String, u64>,
}

impl FoldedStacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` to `key`, merging with any existing count.
    pub fn insert(&mut self, key: impl Into<String>, count: u64) {
        *self.stacks.entry(key.into()).or_insert(0) += count;
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.stacks.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn total_samples(&self) -> u64 {
        self.stacks.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.stacks.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Entries by count (descending), ties by key.
    pub fn sorted_by_count(&self) -> Vec<(&str, u64)> {
        let mut entries = self.iter().collect::<Vec<_>>();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }

    /// Keep only stacks seen at least `min_count` times. Never touches `self`.
    pub fn filter_min_count(&self, min_count: u64) -> FoldedStacks {
        self.stacks
            .iter()
            .filter(|(_, &count)| count >= min_count)
            .map(|(k, &v)| (k.clone(), v))
            .collect()
    }

    /// `stack count` lines, hottest first.
    pub fn to_folded_text(&self) -> String {
        let mut output = String::new();
        for (stack, count) in self.sorted_by_count() {
            output.push_str(stack);
            output.push(' ');
            output.push_str(&count.to_string());
            output.push('\n');
        }
        output
    }

    /// Parse `stack count` lines. Blank lines are skipped; repeated stacks are
    /// merged.
    pub fn parse_folded_text(text: &str) -> Result<Self, ParseError> {
        let mut stacks = FoldedStacks::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let (stack, count) = line.rsplit_once(' ').ok_or(ParseError {
                line: i + 1,
                reason: "missing sample count",
            })?;
            let count = count.parse::<u64>().map_err(|_| ParseError {
                line: i + 1,
                reason: "invalid sample count",
            })?;
            if stack.is_empty() {
                return Err(ParseError {
                    line: i + 1,
                    reason: "empty stack",
                });
            }
            stacks.insert(stack, count);
        }
        Ok(stacks)
    }
}

impl FromIterator<(String, u64)> for FoldedStacks {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut stacks = FoldedStacks::new();
        for (key, count) in iter {
            stacks.insert(key, count);
        }
        stacks
    }
}

impl<'a> IntoIterator for &'a FoldedStacks {
    type Item = (&'a String, &'a u64);
    type IntoIter = btree_map::Iter<'a, String, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.stacks.iter()
    }
}

/// Split a folded key into its frame labels.
pub fn split_frames(key: &str) -> impl Iterator<Item = &str> {
    key.split(FRAME_SEPARATOR)
}
