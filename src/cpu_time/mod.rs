//! Per-thread CPU accounting between sampling passes.
//!
//! Two variants: on Linux each thread's CPU clock is read through its
//! per-thread POSIX clock, keyed by the `(runtime_tid, native_tid)` pair to
//! resist kernel thread-id reuse. Everywhere else, the process-wide CPU
//! delta is divided evenly across the live threads, which is unfair per
//! thread but unbiased in aggregate.
//!
//! Neither variant surfaces errors: an unreadable clock yields a zero delta
//! for that thread on that pass.

use rustc_hash::FxHashMap;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod per_thread;
        use per_thread::PerThreadCpuTime;
    }
}

/// CPU nanoseconds charged to each live thread since the previous call.
pub(crate) enum ThreadCpuTime {
    #[cfg(target_os = "linux")]
    PerThread(PerThreadCpuTime),
    ProcessWide(ProcessWideCpuTime),
}

/// Whether the current platform can actually read per-thread CPU clocks,
/// probed against the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn per_thread_clocks_supported() -> bool {
    per_thread::clock_readable_for_current_thread()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn per_thread_clocks_supported() -> bool {
    false
}

impl ThreadCpuTime {
    /// Pick the best variant the platform supports, probing per-thread
    /// clock availability at start time.
    pub fn new() -> Self {
        #[cfg(target_os = "linux")]
        if per_thread_clocks_supported() {
            return ThreadCpuTime::PerThread(PerThreadCpuTime::new());
        }
        ThreadCpuTime::ProcessWide(ProcessWideCpuTime::new())
    }

    /// CPU nanoseconds attributed to each thread in `live_threads`
    /// (runtime tid → native tid) since the previous call.
    ///
    /// The caller must have frozen runtime thread destruction for the
    /// duration of the pass this call belongs to; clock lookups on
    /// destroyed threads are what the freeze protects against.
    pub fn delta(&mut self, live_threads: &FxHashMap<u64, u64>) -> FxHashMap<u64, u64> {
        match self {
            #[cfg(target_os = "linux")]
            ThreadCpuTime::PerThread(inner) => inner.delta(live_threads),
            ThreadCpuTime::ProcessWide(inner) => inner.delta(live_threads),
        }
    }
}

/// Portable fallback: one process-wide CPU clock, divided evenly.
pub(crate) struct ProcessWideCpuTime {
    last_process_cpu_ns: u64,
}

impl ProcessWideCpuTime {
    pub fn new() -> Self {
        ProcessWideCpuTime {
            last_process_cpu_ns: process_cpu_ns(),
        }
    }

    pub fn delta(&mut self, live_threads: &FxHashMap<u64, u64>) -> FxHashMap<u64, u64> {
        self.delta_at(process_cpu_ns(), live_threads)
    }

    fn delta_at(&mut self, now_ns: u64, live_threads: &FxHashMap<u64, u64>) -> FxHashMap<u64, u64> {
        let elapsed = now_ns.saturating_sub(self.last_process_cpu_ns);
        self.last_process_cpu_ns = now_ns;
        let n_threads = live_threads.len() as u64;
        if n_threads == 0 {
            return FxHashMap::default();
        }
        let share = elapsed / n_threads;
        live_threads.keys().map(|&tid| (tid, share)).collect()
    }
}

/// Total CPU time consumed by the process, in nanoseconds. Zero when the
/// platform has no readable process clock.
#[cfg(unix)]
fn process_cpu_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) } != 0 {
        return 0;
    }
    timespec_ns(&ts)
}

#[cfg(not(unix))]
fn process_cpu_ns() -> u64 {
    0
}

#[cfg(unix)]
pub(crate) fn timespec_ns(ts: &libc::timespec) -> u64 {
    (ts.tv_sec as u64).saturating_mul(1_000_000_000) + ts.tv_nsec as u64
}
