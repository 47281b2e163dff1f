//! An in-process periodic stack-sampling CPU/wall profiler core for
//! managed runtimes that host user threads.
//!
//! The host runtime publishes its live threads through a
//! [`runtime::ThreadTable`] and resolves names and OS ids through a
//! [`runtime::ThreadRegistry`]. A dedicated sampler thread then walks every
//! hosted thread at a self-regulated cadence, captures call stacks and
//! in-flight exceptions, attributes wall and CPU time, correlates samples
//! with active tracing spans, and delivers typed events on a channel.
//!
//! The sleep between passes stretches automatically so that sampling never
//! consumes more than the configured fraction of wall time.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use stackpulse::runtime::{ThreadRegistry, ThreadTable};
//! use stackpulse::symbolize::ChainSymbolizer;
//! use stackpulse::{RunningSampler, SamplerConfig};
//!
//! # fn run() -> Result<(), stackpulse::ConfigError> {
//! let table = Arc::new(ThreadTable::new());
//! let registry = Arc::new(ThreadRegistry::new());
//! let (sender, receiver) = crossbeam_channel::unbounded();
//!
//! let sampler = RunningSampler::start(
//!     SamplerConfig::default(),
//!     Arc::clone(&table),
//!     Arc::clone(&registry),
//!     Arc::new(ChainSymbolizer),
//!     None, // no tracer: no span correlation
//!     sender,
//! )?;
//!
//! // Hosted threads attach to `table`, publish their current frame, and
//! // show up in the events read from `receiver`.
//!
//! let stats = sampler.stop();
//! # drop(receiver);
//! # let _ = stats;
//! # Ok(())
//! # }
//! ```

mod collector;
mod cpu_time;
mod error;
mod event;
mod profiler_threads;
pub mod runtime;
mod span_links;
pub mod symbolize;
pub mod tracer;
mod walker;

pub use collector::{
    RunningSampler, SamplerConfig, SamplerStats, MIN_INTERVAL, SAMPLER_THREAD_NAME,
};
pub use error::{ConfigError, SymbolizeError};
pub use event::{Frame, SampleEvent, StackExceptionSampleEvent, StackSampleEvent};
pub use span_links::ThreadSpanLinks;

/// What the current platform supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    /// Per-thread CPU clocks are available; without them, process CPU time
    /// is divided evenly across threads.
    pub cpu_time: bool,
    /// In-flight exceptions can be enumerated alongside stacks.
    pub stack_exceptions: bool,
}

/// Report the capabilities sampling will run with on this platform.
pub fn features() -> Features {
    Features {
        cpu_time: cpu_time::per_thread_clocks_supported(),
        stack_exceptions: true,
    }
}
