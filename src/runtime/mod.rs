//! The seam between the profiler and the host runtime.
//!
//! The host publishes its view of the world through two structures:
//!
//! - [`ThreadTable`]: the runtime's internal list of live threads, grouped
//!   by runtime instance. Its mutex is what freezes thread creation and
//!   destruction for the duration of one sampling pass.
//! - [`ThreadRegistry`]: the runtime's user-facing registry of threads,
//!   used only to resolve names and OS-level thread ids.
//!
//! Frame and traceback objects are opaque to the sampler; they are handed
//! to the symbolizer unchanged.

use std::sync::Arc;

mod registry;
mod thread_table;

pub use registry::{ThreadIdentity, ThreadRegistry};
pub use thread_table::{
    CapturedException, CapturedStack, FrozenThreads, ThreadStateHandle, ThreadTable,
};

/// A raw in-runtime call frame, as published by a hosted thread.
///
/// `back` points at the caller's frame; the chain ends at the thread's
/// entry point. All fields are reference-counted so that capturing a frame
/// during a pass pins it without copying.
#[derive(Debug)]
pub struct FrameObject {
    pub function: Arc<str>,
    pub filename: Arc<str>,
    pub lineno: u32,
    pub back: Option<Arc<FrameObject>>,
}

/// A raw traceback node. `next` points one level deeper, towards the frame
/// in which the exception was raised.
#[derive(Debug)]
pub struct TracebackObject {
    pub frame: Arc<FrameObject>,
    pub lineno: u32,
    pub next: Option<Arc<TracebackObject>>,
}

/// The topmost in-flight exception on a thread. An exception without a
/// traceback is ignored by the sampler.
#[derive(Debug, Clone)]
pub struct PendingException {
    pub exc_type: Arc<str>,
    pub traceback: Option<Arc<TracebackObject>>,
}

/// The runtime-level id of the calling thread.
///
/// On unix this is the pthread handle, which is also what the per-thread
/// CPU clock lookup is keyed on. Captured once per thread, at attach time.
#[cfg(unix)]
pub fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

/// The runtime-level id of the calling thread.
#[cfg(not(unix))]
pub fn current_thread_id() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// The OS-level (kernel) id of the calling thread, if the platform
        /// exposes one. Thread registries record this next to the runtime
        /// id because kernel thread ids can be reused once a thread dies.
        pub fn native_thread_id() -> Option<u64> {
            Some(unsafe { libc::syscall(libc::SYS_gettid) } as u64)
        }
    } else if #[cfg(unix)] {
        /// The OS-level id of the calling thread, if the platform exposes
        /// one.
        pub fn native_thread_id() -> Option<u64> {
            Some(unsafe { libc::pthread_self() as u64 })
        }
    } else {
        /// The OS-level id of the calling thread, if the platform exposes
        /// one.
        pub fn native_thread_id() -> Option<u64> {
            None
        }
    }
}
