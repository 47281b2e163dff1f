use rustc_hash::FxHashMap;

use super::timespec_ns;

/// Composite key for the per-thread clock cache. Both halves are needed:
/// OS-level thread ids may be reused after a thread dies, and the pair is
/// stable-unique for practical purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ThreadKey {
    runtime_tid: u64,
    native_tid: u64,
}

/// Per-thread CPU accounting through POSIX thread CPU clocks.
///
/// The cache holds the last observed CPU value for exactly the threads of
/// the most recent pass; keys that drop out of the live set are evicted on
/// every call.
pub(crate) struct PerThreadCpuTime {
    last_cpu_ns: FxHashMap<ThreadKey, u64>,
}

impl PerThreadCpuTime {
    pub fn new() -> Self {
        PerThreadCpuTime {
            last_cpu_ns: FxHashMap::default(),
        }
    }

    pub fn delta(&mut self, live_threads: &FxHashMap<u64, u64>) -> FxHashMap<u64, u64> {
        let mut deltas = FxHashMap::default();
        let mut next_cache = FxHashMap::default();
        next_cache.reserve(live_threads.len());

        for (&runtime_tid, &native_tid) in live_threads {
            let key = ThreadKey {
                runtime_tid,
                native_tid,
            };
            let previous = self.last_cpu_ns.get(&key).copied();
            // An unreadable clock (thread died, permission denied) falls
            // back to the cached value: zero delta for this pass.
            let current = match thread_cpu_ns(runtime_tid) {
                Some(ns) => ns,
                None => previous.unwrap_or(0),
            };
            // A new key charges from its first observation; a reused
            // native id can make the raw delta negative, which clamps to
            // zero.
            let delta = current.saturating_sub(previous.unwrap_or(current));
            deltas.insert(runtime_tid, delta);
            next_cache.insert(key, current);
        }

        self.last_cpu_ns = next_cache;
        deltas
    }

    #[cfg(test)]
    pub fn cached_keys(&self) -> usize {
        self.last_cpu_ns.len()
    }
}

/// Probe whether per-thread clocks work here at all, using the calling
/// thread's own clock.
pub(crate) fn clock_readable_for_current_thread() -> bool {
    thread_cpu_ns(unsafe { libc::pthread_self() } as u64).is_some()
}

/// Read the CPU clock of the thread whose pthread handle is `runtime_tid`.
///
/// Looking up the clock of a thread that no longer exists can crash the
/// process; callers rely on the runtime's thread-destruction freeze to keep
/// every id in the live set valid for the duration of the pass.
fn thread_cpu_ns(runtime_tid: u64) -> Option<u64> {
    let mut clock_id: libc::clockid_t = 0;
    if unsafe { libc::pthread_getcpuclockid(runtime_tid as libc::pthread_t, &mut clock_id) } != 0 {
        return None;
    }
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return None;
    }
    Some(timespec_ns(&ts))
}
