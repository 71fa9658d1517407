//! Parent/child frame tree derived from a folded-stack table, and the
//! proportional layout the graphical reports draw from it.
//!
//! Nodes are keyed by frame label, not by call path: a label's count is the
//! total of every stack that contains it, wherever it appears.

use std::cmp::Ordering;

use ahash::{AHashMap, AHashSet};
use tracing::debug;

use crate::stacks::{split_frames, FoldedStacks};

pub const MAX_TREE_DEPTH: usize = 64;
/// Upper bound on nodes in one tree. Once reached, the deepest rows are
/// left out.
pub const MAX_TREE_NODES: usize = 20_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameNode {
    pub label: String,
    pub count: u64,
    /// By count (descending), then label.
    pub children: Vec<FrameNode>,
    pub is_root: bool,
}

impl FrameNode {
    pub fn child(&self, label: &str) -> Option<&FrameNode> {
        self.children.iter().find(|c| c.label == label)
    }

    pub fn children_total(&self) -> u64 {
        self.children.iter().map(|c| c.count).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    /// Rows, roots included.
    pub max_depth: usize,
    pub max_nodes: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_depth: MAX_TREE_DEPTH,
            max_nodes: MAX_TREE_NODES,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameHierarchy {
    roots: Vec<FrameNode>,
    counts: AHashMap<String, u64>,
    total_samples: u64,
    nodes: usize,
    truncated: bool,
}

struct Edges<'a> {
    counts: AHashMap<&'a str, u64>,
    children: AHashMap<&'a str, AHashSet<&'a str>>,
}

impl Edges<'_> {
    fn count(&self, label: &str) -> u64 {
        self.counts.get(label).copied().unwrap_or(0)
    }

    fn hotter_first(&self, a: &str, b: &str) -> Ordering {
        self.count(b).cmp(&self.count(a)).then_with(|| a.cmp(b))
    }
}

/// A node placed during expansion. Children always come after their parent.
struct Slot<'a> {
    label: &'a str,
    parent: Option<usize>,
    depth: usize,
    children: Vec<usize>,
}

fn on_path(slots: &[Slot<'_>], mut at: usize, label: &str) -> bool {
    loop {
        if slots[at].label == label {
            return true;
        }
        match slots[at].parent {
            Some(parent) => at = parent,
            None => return false,
        }
    }
}

impl FrameHierarchy {
    pub fn build(stacks: &FoldedStacks) -> Self {
        Self::build_with(stacks, &BuildOptions::default())
    }

    /// Expansion is breadth first, so a node budget that runs out drops whole
    /// deep rows before it touches shallow ones.
    pub fn build_with(stacks: &FoldedStacks, options: &BuildOptions) -> Self {
        let mut edges = Edges {
            counts: AHashMap::new(),
            children: AHashMap::new(),
        };
        let mut has_parent = AHashSet::new();
        let mut first_frames = Vec::new();

        for (key, count) in stacks.iter() {
            let frames = split_frames(key)
                .filter(|f| !f.is_empty())
                .collect::<Vec<_>>();

            // once per key, even if the label recurs inside it
            let distinct = frames.iter().copied().collect::<AHashSet<_>>();
            for label in distinct {
                *edges.counts.entry(label).or_insert(0) += count;
            }

            for pair in frames.windows(2) {
                edges.children.entry(pair[0]).or_default().insert(pair[1]);
                has_parent.insert(pair[1]);
            }

            if let Some(&first) = frames.first() {
                if !first_frames.contains(&first) {
                    first_frames.push(first);
                }
            }
        }

        let mut root_labels = edges
            .counts
            .keys()
            .copied()
            .filter(|label| !has_parent.contains(label))
            .collect::<Vec<_>>();
        if root_labels.is_empty() {
            root_labels = first_frames;
        }
        root_labels.sort_by(|a, b| edges.hotter_first(a, b));

        let max_nodes = options.max_nodes.max(1);
        let mut truncated = root_labels.len() > max_nodes;
        let mut slots = root_labels
            .into_iter()
            .take(max_nodes)
            .map(|label| Slot {
                label,
                parent: None,
                depth: 0,
                children: Vec::new(),
            })
            .collect::<Vec<_>>();
        let root_count = slots.len();

        let mut next = 0;
        while next < slots.len() {
            let depth = slots[next].depth;
            let children = match edges.children.get(slots[next].label) {
                Some(children) if depth + 1 < options.max_depth => children,
                _ => {
                    next += 1;
                    continue;
                }
            };

            // recursion: a label already on this path is not repeated
            let mut children = children
                .iter()
                .copied()
                .filter(|child| !on_path(&slots, next, child))
                .collect::<Vec<_>>();
            children.sort_by(|a, b| edges.hotter_first(a, b));

            for label in children {
                if slots.len() >= max_nodes {
                    truncated = true;
                    break;
                }
                let idx = slots.len();
                slots.push(Slot {
                    label,
                    parent: Some(next),
                    depth: depth + 1,
                    children: Vec::new(),
                });
                slots[next].children.push(idx);
            }
            if truncated {
                break;
            }
            next += 1;
        }

        let nodes = slots.len();
        if truncated {
            debug!(nodes, "frame tree truncated");
        }

        // children sit after their parents, so build back to front
        let mut built = Vec::<Option<FrameNode>>::new();
        built.resize_with(nodes, || None);
        for (idx, slot) in slots.iter().enumerate().rev() {
            let children = slot
                .children
                .iter()
                .filter_map(|&child| built[child].take())
                .collect();
            built[idx] = Some(FrameNode {
                label: slot.label.to_string(),
                count: edges.count(slot.label),
                children,
                is_root: slot.parent.is_none(),
            });
        }
        let roots = built.into_iter().take(root_count).flatten().collect();

        let counts = edges
            .counts
            .iter()
            .map(|(&label, &count)| (label.to_string(), count))
            .collect();

        Self {
            roots,
            counts,
            total_samples: stacks.total_samples(),
            nodes,
            truncated,
        }
    }

    /// Nodes in the tree, over all roots.
    pub fn node_count(&self) -> usize {
        self.nodes
    }

    /// Whether the node budget cut the tree short.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn roots(&self) -> &[FrameNode] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn count_of(&self, label: &str) -> Option<u64> {
        self.counts.get(label).copied()
    }

    pub fn distinct_frames(&self) -> usize {
        self.counts.len()
    }

    /// Place every node on a `width`-wide canvas, one row per depth.
    ///
    /// Roots split the full width by count. A child gets its share of the
    /// parent's width relative to its siblings, never less than
    /// `min_width`; children that would start past the parent's right edge
    /// are dropped along with their subtrees.
    pub fn layout(&self, options: &LayoutOptions) -> Vec<FrameRect<'_>> {
        let roots = &self.roots[..self.roots.len().min(options.max_roots)];
        let total = roots.iter().map(|r| r.count).sum::<u64>();
        let mut rects = Vec::new();
        if total == 0 {
            return rects;
        }

        let mut x = 0.0;
        for (i, root) in roots.iter().enumerate() {
            let width = root.count as f64 / total as f64 * options.width;
            place(root, x, width, 0, i, options, &mut rects);
            x += width;
        }
        rects
    }
}

#[derive(Debug, Clone)]
pub struct LayoutOptions {
    pub width: f64,
    pub min_width: f64,
    pub max_depth: usize,
    pub max_roots: usize,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            width: 1.0,
            min_width: 0.0,
            max_depth: MAX_TREE_DEPTH,
            max_roots: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameRect<'a> {
    pub node: &'a FrameNode,
    pub x: f64,
    pub width: f64,
    pub depth: usize,
    /// Index of the root this frame descends from.
    pub root: usize,
}

fn place<'a>(
    node: &'a FrameNode,
    x: f64,
    width: f64,
    depth: usize,
    root: usize,
    options: &LayoutOptions,
    rects: &mut Vec<FrameRect<'a>>,
) {
    if depth >= options.max_depth {
        return;
    }
    rects.push(FrameRect {
        node,
        x,
        width,
        depth,
        root,
    });

    let siblings = node.children_total();
    if siblings == 0 {
        return;
    }

    let end = x + width;
    let mut child_x = x;
    for child in &node.children {
        if child_x >= end {
            break;
        }
        let share = child.count as f64 / siblings as f64 * width;
        let child_width = share.max(options.min_width).min(end - child_x);
        place(child, child_x, child_width, depth + 1, root, options, rects);
        child_x += child_width;
    }
}
