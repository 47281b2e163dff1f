use lazy_static::lazy_static;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

lazy_static! {
    /// Runtime thread ids owned by the profiler subsystem, process-wide.
    /// Written on sampler thread start/stop, read during each pass.
    static ref PROFILER_TIDS: Mutex<FxHashSet<u64>> = Mutex::new(FxHashSet::default());
}

pub(crate) fn register(tid: u64) {
    PROFILER_TIDS.lock().insert(tid);
}

pub(crate) fn deregister(tid: u64) {
    PROFILER_TIDS.lock().remove(&tid);
}

pub(crate) fn snapshot() -> FxHashSet<u64> {
    PROFILER_TIDS.lock().clone()
}
