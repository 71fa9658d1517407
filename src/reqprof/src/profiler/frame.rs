use std::fmt::Write;

use super::{thread::RawFrame, AnalysisMode};
use crate::stacks::FRAME_SEPARATOR;

/// Separates the analysis-mode tag from the thread name on the first frame.
pub const MODE_TAG_SEPARATOR: char = '|';

// labels end up in `stack count` lines and `;`-joined keys
fn push_sanitized(out: &mut String, s: &str) {
    for c in s.chars() {
        out.push(match c {
            FRAME_SEPARATOR => ':',
            '\n' | '\r' | '\t' => ' ',
            c => c,
        });
    }
}

/// Canonical label for a frame: `declaring::member:line`.
pub fn frame_label(frame: &RawFrame) -> String {
    let mut label = String::with_capacity(frame.declaring.len() + frame.member.len() + 8);
    if !frame.declaring.is_empty() {
        push_sanitized(&mut label, &frame.declaring);
        label.push_str("::");
    }
    push_sanitized(&mut label, &frame.member);
    if let Some(line) = frame.line.filter(|&l| l > 0) {
        let _ = write!(label, ":{line}");
    }
    label
}

/// Label of the synthetic outermost frame naming the sampled thread.
pub fn thread_label(thread_name: &str, mode: AnalysisMode) -> String {
    let mut label = String::new();
    if let Some(tag) = mode.tag() {
        label.push_str(tag);
        label.push(MODE_TAG_SEPARATOR);
    }
    push_sanitized(&mut label, thread_name);
    label
}

/// Fold a captured stack (innermost frame first) into a key, outermost first.
///
/// At most `max_depth` frames are kept, counted from the innermost one, so very
/// deep stacks lose their outer callers rather than their hot leaves.
pub fn folded_key(
    thread_name: &str,
    mode: AnalysisMode,
    frames: &[RawFrame],
    max_depth: usize,
) -> String {
    let kept = &frames[..frames.len().min(max_depth)];

    let mut key = thread_label(thread_name, mode);
    for frame in kept.iter().rev() {
        key.push(FRAME_SEPARATOR);
        key.push_str(&frame_label(frame));
    }
    key
}

/// Split the mode tag off a thread label, if it carries one.
pub fn parse_mode_tag(label: &str) -> Option<(AnalysisMode, &str)> {
    let (tag, rest) = label.split_once(MODE_TAG_SEPARATOR)?;
    let mode = AnalysisMode::from_tag(tag)?;
    Some((mode, rest))
}
