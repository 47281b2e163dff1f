use rustc_hash::FxHashSet;

/// One symbolic stack level, as produced by the symbolizer. The sampler
/// carries frames through to the event stream without looking inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: String,
    pub filename: String,
    pub lineno: u32,
}

/// A wall/CPU stack sample for one thread, taken during one sampling pass.
#[derive(Debug, Clone)]
pub struct StackSampleEvent {
    pub thread_id: u64,
    pub thread_native_id: u64,
    pub thread_name: String,
    /// Trace ids of the unfinished leaf spans active on this thread.
    pub trace_ids: FxHashSet<u64>,
    /// Innermost frame first, truncated to the configured depth.
    pub frames: Vec<Frame>,
    /// Total stack depth, including frames dropped by truncation.
    pub nframes: usize,
    pub wall_time_ns: u64,
    pub cpu_time_ns: u64,
    pub sampling_period_ns: u64,
}

/// A sample of a thread's topmost in-flight exception.
#[derive(Debug, Clone)]
pub struct StackExceptionSampleEvent {
    pub thread_id: u64,
    pub thread_native_id: u64,
    pub thread_name: String,
    pub frames: Vec<Frame>,
    pub nframes: usize,
    pub sampling_period_ns: u64,
    pub exc_type: String,
}

/// What the sampler delivers to the downstream channel.
#[derive(Debug, Clone)]
pub enum SampleEvent {
    Stack(StackSampleEvent),
    Exception(StackExceptionSampleEvent),
}
