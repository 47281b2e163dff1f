use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::runtime::current_thread_id;
use crate::tracer::Span;

/// Maps each thread to the set of currently active (unfinished) spans that
/// were started on it.
///
/// Spans are held weakly: the mapping never extends a span's lifetime, and
/// a span dropped by the tracer vanishes from the mapping without explicit
/// removal. The mutex protects only map and set mutation; finished/parent
/// inspection happens on a local snapshot, outside the lock, so span
/// implementations are never called back under it.
pub struct ThreadSpanLinks {
    inner: Mutex<FxHashMap<u64, Vec<Weak<dyn Span>>>>,
}

impl ThreadSpanLinks {
    pub fn new() -> Self {
        ThreadSpanLinks {
            inner: Mutex::new(FxHashMap::default()),
        }
    }

    /// Bind `span` to the calling thread. Invoked by the tracer's
    /// span-start callback, which runs on the thread that started the span.
    pub fn link_span(&self, span: &Arc<dyn Span>) {
        self.link_span_on(current_thread_id(), span);
    }

    /// Bind `span` to an explicit thread id.
    pub fn link_span_on(&self, tid: u64, span: &Arc<dyn Span>) {
        let weak = Arc::downgrade(span);
        let mut inner = self.inner.lock();
        let spans = inner.entry(tid).or_default();
        // Dead entries are reaped opportunistically; duplicates are not
        // linked twice.
        spans.retain(|s| s.strong_count() > 0);
        if !spans.iter().any(|s| Weak::ptr_eq(s, &weak)) {
            spans.push(weak);
        }
    }

    /// Drop link entries for threads not present in `live_tids`. Called
    /// once per sampling pass, before attribution.
    pub fn clear_threads(&self, live_tids: &FxHashSet<u64>) {
        self.inner.lock().retain(|tid, _| live_tids.contains(tid));
    }

    /// The unfinished leaf spans on `tid`: spans that are not finished and
    /// have no unfinished child in the current link set. A span with an
    /// unfinished child is not a leaf; the child is what a sample belongs
    /// to.
    pub fn leaf_spans(&self, tid: u64) -> Vec<Arc<dyn Span>> {
        // Snapshot under the lock; strong references are held locally from
        // here on.
        let snapshot: Vec<Arc<dyn Span>> = {
            let mut inner = self.inner.lock();
            match inner.get_mut(&tid) {
                Some(spans) => {
                    spans.retain(|s| s.strong_count() > 0);
                    spans.iter().filter_map(Weak::upgrade).collect()
                }
                None => return Vec::new(),
            }
        };

        let parents: Vec<*const ()> = snapshot
            .iter()
            .filter(|span| !span.is_finished())
            .filter_map(|span| span.parent())
            .map(|parent| Arc::as_ptr(&parent) as *const ())
            .collect();

        snapshot
            .into_iter()
            .filter(|span| {
                !span.is_finished() && !parents.contains(&(Arc::as_ptr(span) as *const ()))
            })
            .collect()
    }
}

impl Default for ThreadSpanLinks {
    fn default() -> Self {
        Self::new()
    }
}
