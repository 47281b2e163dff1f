use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::{current_thread_id, FrameObject, PendingException, TracebackObject};

/// The host runtime's internal table of live threads, grouped by runtime
/// instance.
///
/// The table mutex doubles as the freeze point for sampling: a hosted
/// thread detaches by taking the same lock, so while a [`FrozenThreads`]
/// guard is alive no thread in the table can be destroyed. That is what
/// makes the captured frame references and the subsequent per-thread CPU
/// clock lookups safe.
pub struct ThreadTable {
    inner: Arc<Mutex<TableInner>>,
}

struct TableInner {
    instances: Vec<InstanceEntry>,
}

struct InstanceEntry {
    id: u32,
    threads: Vec<Arc<ThreadState>>,
}

struct ThreadState {
    tid: u64,
    shot: Mutex<ThreadShot>,
}

#[derive(Default)]
struct ThreadShot {
    frame: Option<Arc<FrameObject>>,
    exception: Option<PendingException>,
}

/// A hosted thread's handle into the table. The owning thread publishes its
/// current frame and pending exception through it.
///
/// Dropping the handle detaches the thread from the table. The detach takes
/// the table mutex, so it cannot interleave with a frozen enumeration.
pub struct ThreadStateHandle {
    table: Arc<Mutex<TableInner>>,
    state: Arc<ThreadState>,
}

/// Proof that the thread table is frozen. Enumeration happens through this
/// guard; it must be dropped as soon as the capture is done.
pub struct FrozenThreads<'a> {
    guard: MutexGuard<'a, TableInner>,
}

/// A thread id and its current frame, captured under the table freeze.
pub struct CapturedStack {
    pub tid: u64,
    pub frame: Arc<FrameObject>,
}

/// A thread id and its topmost in-flight exception, captured under the
/// table freeze. Only exceptions that carry both a type and a traceback
/// are captured.
pub struct CapturedException {
    pub tid: u64,
    pub exc_type: Arc<str>,
    pub traceback: Arc<TracebackObject>,
}

impl ThreadTable {
    pub fn new() -> Self {
        ThreadTable {
            inner: Arc::new(Mutex::new(TableInner {
                instances: Vec::new(),
            })),
        }
    }

    /// Attach the calling thread to the default runtime instance.
    pub fn attach_current_thread(&self) -> ThreadStateHandle {
        self.attach_thread_to_instance(0, current_thread_id())
    }

    /// Attach a thread under a host-chosen runtime id, to the default
    /// runtime instance.
    pub fn attach_thread(&self, tid: u64) -> ThreadStateHandle {
        self.attach_thread_to_instance(0, tid)
    }

    /// Attach a thread to a specific runtime instance, creating the
    /// instance entry if this is the first thread in it.
    pub fn attach_thread_to_instance(&self, instance_id: u32, tid: u64) -> ThreadStateHandle {
        let state = Arc::new(ThreadState {
            tid,
            shot: Mutex::new(ThreadShot::default()),
        });
        let mut inner = self.inner.lock();
        let index = match inner.instances.iter().position(|i| i.id == instance_id) {
            Some(index) => index,
            None => {
                inner.instances.push(InstanceEntry {
                    id: instance_id,
                    threads: Vec::new(),
                });
                inner.instances.len() - 1
            }
        };
        inner.instances[index].threads.push(Arc::clone(&state));
        ThreadStateHandle {
            table: Arc::clone(&self.inner),
            state,
        }
    }

    /// Freeze the table for enumeration. Returns `None` if the table mutex
    /// is currently held elsewhere; callers then fall back to
    /// [`current_frames`](Self::current_frames).
    pub fn try_freeze(&self) -> Option<FrozenThreads<'_>> {
        self.inner.try_lock().map(|guard| FrozenThreads { guard })
    }

    /// Best-effort snapshot of every thread's current frame, without
    /// exception capture. Used when the freeze could not be taken.
    pub fn current_frames(&self) -> Vec<CapturedStack> {
        let inner = self.inner.lock();
        let mut stacks = Vec::new();
        for instance in &inner.instances {
            for thread in &instance.threads {
                let shot = thread.shot.lock();
                if let Some(frame) = &shot.frame {
                    stacks.push(CapturedStack {
                        tid: thread.tid,
                        frame: Arc::clone(frame),
                    });
                }
            }
        }
        stacks
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrozenThreads<'_> {
    /// Walk every runtime instance and every thread state, capturing each
    /// thread's current frame and its topmost live exception.
    ///
    /// Runs entirely under the table mutex: reference capture only, no
    /// logging, no foreign calls, no blocking I/O.
    pub fn capture(&self) -> (Vec<CapturedStack>, Vec<CapturedException>) {
        let mut stacks = Vec::new();
        let mut exceptions = Vec::new();
        for instance in &self.guard.instances {
            for thread in &instance.threads {
                let shot = thread.shot.lock();
                if let Some(frame) = &shot.frame {
                    stacks.push(CapturedStack {
                        tid: thread.tid,
                        frame: Arc::clone(frame),
                    });
                }
                if let Some(exception) = &shot.exception {
                    if let Some(traceback) = &exception.traceback {
                        exceptions.push(CapturedException {
                            tid: thread.tid,
                            exc_type: Arc::clone(&exception.exc_type),
                            traceback: Arc::clone(traceback),
                        });
                    }
                }
            }
        }
        (stacks, exceptions)
    }
}

impl ThreadStateHandle {
    /// The runtime id this thread is attached under.
    pub fn tid(&self) -> u64 {
        self.state.tid
    }

    /// Publish the thread's current (innermost) frame.
    pub fn set_frame(&self, frame: Arc<FrameObject>) {
        self.state.shot.lock().frame = Some(frame);
    }

    pub fn clear_frame(&self) {
        self.state.shot.lock().frame = None;
    }

    /// Publish the thread's topmost in-flight exception.
    pub fn set_pending_exception(&self, exception: PendingException) {
        self.state.shot.lock().exception = Some(exception);
    }

    pub fn clear_pending_exception(&self) {
        self.state.shot.lock().exception = None;
    }
}

impl Drop for ThreadStateHandle {
    fn drop(&mut self) {
        // Detaching takes the table mutex; a thread cannot disappear while
        // an enumeration holds the freeze.
        let mut inner = self.table.lock();
        for instance in &mut inner.instances {
            instance
                .threads
                .retain(|t| !Arc::ptr_eq(t, &self.state));
        }
    }
}
