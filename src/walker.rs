//! One sampling pass: freeze, enumerate, attribute, emit.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cpu_time::ThreadCpuTime;
use crate::error::SymbolizeError;
use crate::event::{StackExceptionSampleEvent, StackSampleEvent};
use crate::profiler_threads;
use crate::runtime::{CapturedException, CapturedStack, ThreadRegistry, ThreadTable};
use crate::span_links::ThreadSpanLinks;
use crate::symbolize::Symbolizer;

pub(crate) struct PassContext<'a> {
    pub table: &'a ThreadTable,
    pub registry: &'a ThreadRegistry,
    pub symbolizer: &'a dyn Symbolizer,
    pub thread_time: &'a mut ThreadCpuTime,
    pub span_links: Option<&'a ThreadSpanLinks>,
    pub ignore_profiler: bool,
    pub max_nframes: usize,
    pub interval_s: f64,
    pub wall_time_ns: u64,
}

pub(crate) struct PassOutput {
    pub stacks: Vec<StackSampleEvent>,
    pub exceptions: Vec<StackExceptionSampleEvent>,
}

/// Run one pass over the runtime's threads.
///
/// A symbolization error aborts the pass; everything else degrades
/// silently (zero CPU deltas, fallback identities, frames-only snapshot
/// when the table cannot be frozen).
pub(crate) fn run_pass(cx: PassContext<'_>) -> Result<PassOutput, SymbolizeError> {
    // Freeze the thread table and capture frames and exceptions. The guard
    // is dropped as soon as the capture completes; from here on the
    // captured references pin everything we touch. If the freeze cannot be
    // taken, fall back to a frames-only snapshot.
    let (stacks, exceptions) = match cx.table.try_freeze() {
        Some(frozen) => frozen.capture(),
        None => (cx.table.current_frames(), Vec::new()),
    };

    let mut live: FxHashSet<u64> = stacks.iter().map(|s| s.tid).collect();
    live.extend(exceptions.iter().map(|e| e.tid));

    // Prune span links for threads that are gone, before any filtering.
    if let Some(links) = cx.span_links {
        links.clear_threads(&live);
    }

    if cx.ignore_profiler {
        for tid in profiler_threads::snapshot() {
            live.remove(&tid);
        }
    }

    let identities: FxHashMap<u64, _> = live
        .iter()
        .map(|&tid| (tid, cx.registry.identity_for(tid)))
        .collect();

    // CPU attribution happens strictly after frame capture, so each
    // thread's delta covers a window ending at or after its snapshot.
    let live_native: FxHashMap<u64, u64> = identities
        .iter()
        .map(|(&tid, identity)| (tid, identity.native_tid))
        .collect();
    let cpu = cx.thread_time.delta(&live_native);

    let sampling_period_ns = (cx.interval_s * 1e9).round() as u64;

    let mut output = PassOutput {
        stacks: Vec::with_capacity(stacks.len()),
        exceptions: Vec::with_capacity(exceptions.len()),
    };

    for CapturedStack { tid, frame } in stacks {
        let identity = match identities.get(&tid) {
            Some(identity) => identity,
            None => continue, // filtered out above
        };
        let trace_ids = match cx.span_links {
            Some(links) => links
                .leaf_spans(tid)
                .iter()
                .map(|span| span.trace_id())
                .collect(),
            None => FxHashSet::default(),
        };
        let (frames, nframes) = cx.symbolizer.framify(&frame, cx.max_nframes)?;
        output.stacks.push(StackSampleEvent {
            thread_id: tid,
            thread_native_id: identity.native_tid,
            thread_name: identity.name.clone(),
            trace_ids,
            frames,
            nframes,
            wall_time_ns: cx.wall_time_ns,
            cpu_time_ns: cpu.get(&tid).copied().unwrap_or(0),
            sampling_period_ns,
        });
    }

    for CapturedException {
        tid,
        exc_type,
        traceback,
    } in exceptions
    {
        let identity = match identities.get(&tid) {
            Some(identity) => identity,
            None => continue,
        };
        let (frames, nframes) = cx.symbolizer.traceback_framify(&traceback, cx.max_nframes)?;
        output.exceptions.push(StackExceptionSampleEvent {
            thread_id: tid,
            thread_native_id: identity.native_tid,
            thread_name: identity.name.clone(),
            frames,
            nframes,
            sampling_period_ns,
            exc_type: exc_type.to_string(),
        });
    }

    Ok(output)
}
