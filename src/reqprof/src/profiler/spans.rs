//! Thread stacks reconstructed from `tracing` spans.
//!
//! [`SpanStackLayer`] records, per thread, the spans currently entered on it.
//! A snapshot of that stack is what the sampler folds: each entered span is one
//! frame, labelled with its module path and name.

use std::{
    cell::{Cell, RefCell},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, ThreadId},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{span, Metadata, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use super::thread::{RawFrame, ThreadSnapshot, ThreadSnapshotProvider, ThreadState};

/// Span field marking a span as waiting on a lock. A thread whose innermost
/// entered span declares it is reported as [`ThreadState::Blocked`].
pub const LOCK_WAIT_FIELD: &str = "lock_wait";

struct Entered {
    id: span::Id,
    metadata: &'static Metadata<'static>,
}

impl Entered {
    fn frame(&self) -> RawFrame {
        let declaring = self
            .metadata
            .module_path()
            .unwrap_or_else(|| self.metadata.target());
        RawFrame::new(declaring, self.metadata.name(), self.metadata.line())
    }

    fn is_lock_wait(&self) -> bool {
        self.metadata.fields().field(LOCK_WAIT_FIELD).is_some()
    }
}

struct ThreadEntry {
    name: String,
    background: AtomicBool,
    stack: Mutex<Vec<Entered>>,
}

impl ThreadEntry {
    fn snapshot(&self) -> ThreadSnapshot {
        let stack = self.stack.lock();
        let state = match stack.last() {
            None => ThreadState::Idle,
            Some(innermost) if innermost.is_lock_wait() => ThreadState::Blocked,
            Some(_) => ThreadState::Running,
        };

        ThreadSnapshot {
            name: self.name.clone(),
            background: self.background.load(Ordering::Relaxed),
            state,
            stack: Ok(stack.iter().rev().map(Entered::frame).collect()),
        }
    }
}

#[derive(Default)]
struct ThreadTable {
    threads: DashMap<ThreadId, Arc<ThreadEntry>>,
}

// Per-thread bookkeeping: which tables know about this thread, so its entries
// go away when the thread exits.
struct Registrations {
    thread: ThreadId,
    background: Cell<bool>,
    tables: RefCell<Vec<Weak<ThreadTable>>>,
}

impl Registrations {
    fn new() -> Self {
        Self {
            thread: thread::current().id(),
            background: Cell::new(false),
            tables: RefCell::new(Vec::new()),
        }
    }
}

impl Drop for Registrations {
    fn drop(&mut self) {
        for table in self.tables.get_mut().drain(..) {
            if let Some(table) = table.upgrade() {
                table.threads.remove(&self.thread);
            }
        }
    }
}

thread_local! {
    static REGISTRATIONS: Registrations = Registrations::new();
}

/// Mark the calling thread as a service thread that never runs request work.
/// Its stacks are left out of every profile.
pub fn mark_background() {
    let _ = REGISTRATIONS.try_with(|regs| {
        regs.background.set(true);
        for table in regs.tables.borrow().iter().filter_map(Weak::upgrade) {
            if let Some(entry) = table.threads.get(&regs.thread) {
                entry.background.store(true, Ordering::Relaxed);
            }
        }
    });
}

/// `tracing-subscriber` layer exposing entered spans as thread stacks.
///
/// Clones share state: install one clone in the subscriber and hand another to
/// [`Profiler::new`](super::Profiler::new).
#[derive(Clone, Default)]
pub struct SpanStackLayer {
    table: Arc<ThreadTable>,
}

impl SpanStackLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for the calling thread, registering it on first use. `None` while
    /// the thread is being torn down.
    fn current_entry(&self) -> Option<Arc<ThreadEntry>> {
        REGISTRATIONS
            .try_with(|regs| {
                if let Some(entry) = self.table.threads.get(&regs.thread) {
                    return entry.value().clone();
                }

                let current = thread::current();
                let name = current
                    .name()
                    .map(String::from)
                    .unwrap_or_else(|| format!("{:?}", regs.thread));
                let entry = Arc::new(ThreadEntry {
                    name,
                    background: AtomicBool::new(regs.background.get()),
                    stack: Mutex::new(Vec::new()),
                });

                self.table.threads.insert(regs.thread, entry.clone());
                regs.tables.borrow_mut().push(Arc::downgrade(&self.table));
                entry
            })
            .ok()
    }
}

impl<S> Layer<S> for SpanStackLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_enter(&self, id: &span::Id, ctx: Context<'_, S>) {
        let Some(metadata) = ctx.metadata(id) else {
            return;
        };
        if let Some(entry) = self.current_entry() {
            entry.stack.lock().push(Entered {
                id: id.clone(),
                metadata,
            });
        }
    }

    fn on_exit(&self, id: &span::Id, _ctx: Context<'_, S>) {
        if let Some(entry) = self.current_entry() {
            let mut stack = entry.stack.lock();
            if let Some(pos) = stack.iter().rposition(|e| e.id == *id) {
                stack.remove(pos);
            }
        }
    }
}

impl ThreadSnapshotProvider for SpanStackLayer {
    fn threads(&self) -> anyhow::Result<Vec<ThreadSnapshot>> {
        // clone the entries first so no shard lock is held while reading stacks
        let entries = self
            .table
            .threads
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();

        Ok(entries.iter().map(|entry| entry.snapshot()).collect())
    }
}

#[cfg(test)]
mod tests {
    use tracing::info_span;
    use tracing_subscriber::{layer::SubscriberExt, registry};

    use super::*;

    fn current_thread_snapshot(layer: &SpanStackLayer) -> Option<ThreadSnapshot> {
        let name = thread::current()
            .name()
            .map(String::from)
            .unwrap_or_else(|| format!("{:?}", thread::current().id()));
        layer
            .threads()
            .unwrap()
            .into_iter()
            .find(|t| t.name == name)
    }

    #[test]
    fn tracks_entered_spans_innermost_first() {
        let layer = SpanStackLayer::new();
        let subscriber = registry().with(layer.clone());

        tracing::subscriber::with_default(subscriber, || {
            let outer = info_span!("handle_request");
            let _outer = outer.enter();
            let inner = info_span!("load_user");
            let _inner = inner.enter();

            let snapshot = current_thread_snapshot(&layer).unwrap();
            let frames = snapshot.stack.unwrap();
            assert_eq!(snapshot.state, ThreadState::Running);
            assert_eq!(
                frames.iter().map(|f| f.member.as_str()).collect::<Vec<_>>(),
                ["load_user", "handle_request"]
            );
            assert!(frames[0].declaring.ends_with("spans::tests"));
            assert!(frames[0].line.is_some());
        });
    }

    #[test]
    fn exits_pop_frames() {
        let layer = SpanStackLayer::new();
        let subscriber = registry().with(layer.clone());

        tracing::subscriber::with_default(subscriber, || {
            let outer = info_span!("outer");
            let _outer = outer.enter();
            {
                let inner = info_span!("inner");
                let _inner = inner.enter();
            }

            let frames = current_thread_snapshot(&layer).unwrap().stack.unwrap();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].member, "outer");
        });

        let snapshot = current_thread_snapshot(&layer).unwrap();
        assert_eq!(snapshot.state, ThreadState::Idle);
    }

    #[test]
    fn lock_wait_spans_mark_thread_blocked() {
        let layer = SpanStackLayer::new();
        let subscriber = registry().with(layer.clone());

        tracing::subscriber::with_default(subscriber, || {
            let outer = info_span!("update");
            let _outer = outer.enter();
            let wait = info_span!("acquire", lock_wait = true);
            let _wait = wait.enter();

            let snapshot = current_thread_snapshot(&layer).unwrap();
            assert_eq!(snapshot.state, ThreadState::Blocked);
        });
    }

    #[test]
    fn background_threads_are_flagged() {
        let layer = SpanStackLayer::new();
        let subscriber = registry().with(layer.clone());

        let worker_layer = layer.clone();
        thread::Builder::new()
            .name("janitor".to_string())
            .spawn(move || {
                tracing::subscriber::with_default(subscriber, || {
                    let span = info_span!("sweep");
                    let _span = span.enter();
                    mark_background();

                    let snapshot = worker_layer
                        .threads()
                        .unwrap()
                        .into_iter()
                        .find(|t| t.name == "janitor")
                        .unwrap();
                    assert!(snapshot.background);
                });
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn exited_threads_are_forgotten() {
        let layer = SpanStackLayer::new();
        let subscriber = registry().with(layer.clone());

        let worker_layer = layer.clone();
        thread::Builder::new()
            .name("short-lived".to_string())
            .spawn(move || {
                tracing::subscriber::with_default(subscriber, || {
                    let span = info_span!("work");
                    let _span = span.enter();
                    assert_eq!(worker_layer.threads().unwrap().len(), 1);
                });
            })
            .unwrap()
            .join()
            .unwrap();

        assert!(layer.threads().unwrap().is_empty());
    }
}
