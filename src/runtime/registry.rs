use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use super::current_thread_id;

/// The runtime's user-facing thread registry: names and OS-level ids, keyed
/// by runtime thread id.
///
/// The bootstrap thread's id is captured at construction, before any
/// cooperative-fiber machinery has a chance to patch the registry. The
/// bootstrap thread resolves to `"MainThread"` even after it has been
/// evicted from the registry.
pub struct ThreadRegistry {
    bootstrap_tid: u64,
    inner: Mutex<FxHashMap<u64, RegisteredThread>>,
}

struct RegisteredThread {
    name: String,
    native_id: Option<u64>,
}

/// What the sampler knows about one live thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadIdentity {
    pub runtime_tid: u64,
    pub native_tid: u64,
    pub name: String,
}

impl ThreadRegistry {
    /// Create a registry, recording the calling thread as the bootstrap
    /// thread. Call this from the runtime's main thread during startup.
    pub fn new() -> Self {
        Self::with_bootstrap_thread(current_thread_id())
    }

    /// Create a registry with an explicit bootstrap thread id.
    pub fn with_bootstrap_thread(bootstrap_tid: u64) -> Self {
        ThreadRegistry {
            bootstrap_tid,
            inner: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn bootstrap_tid(&self) -> u64 {
        self.bootstrap_tid
    }

    pub fn register(&self, tid: u64, name: &str, native_id: Option<u64>) {
        self.inner.lock().insert(
            tid,
            RegisteredThread {
                name: name.to_owned(),
                native_id,
            },
        );
    }

    pub fn deregister(&self, tid: u64) {
        self.inner.lock().remove(&tid);
    }

    /// Resolve the name and native id for a thread observed in the table.
    ///
    /// Threads unknown to the registry still get an identity: their runtime
    /// id stands in for the native id, and the name marks them anonymous.
    /// A registered thread without a native id gets a stable hash instead,
    /// so that the id survives across passes.
    pub fn identity_for(&self, tid: u64) -> ThreadIdentity {
        let inner = self.inner.lock();
        let entry = inner.get(&tid);

        let name = if tid == self.bootstrap_tid {
            "MainThread".to_owned()
        } else if let Some(entry) = entry {
            entry.name.clone()
        } else {
            format!("Anonymous Thread {tid}")
        };

        let native_tid = match entry {
            Some(entry) => entry.native_id.unwrap_or_else(|| stable_fallback_id(tid)),
            None => tid,
        };

        ThreadIdentity {
            runtime_tid: tid,
            native_tid,
            name,
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn stable_fallback_id(tid: u64) -> u64 {
    let mut hasher = FxHasher::default();
    tid.hash(&mut hasher);
    hasher.finish()
}
