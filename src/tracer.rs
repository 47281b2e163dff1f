use std::sync::Arc;

/// The subset of a tracing span the sampler needs to see.
///
/// Spans are always held weakly by the sampler, so implementations keep
/// their own lifetime semantics; a span dropped by the tracer disappears
/// from the sampler's bookkeeping on its own.
pub trait Span: Send + Sync {
    fn trace_id(&self) -> u64;
    fn is_finished(&self) -> bool;
    fn parent(&self) -> Option<Arc<dyn Span>>;
}

/// Callback invoked synchronously on each span start, from the thread that
/// started the span.
pub type SpanObserver = Arc<dyn Fn(Arc<dyn Span>) + Send + Sync>;

/// The tracer the sampler pulls span correlations from.
///
/// Observer deregistration is by identity: pass the same `Arc` that was
/// registered.
pub trait Tracer: Send + Sync {
    fn on_start_span(&self, observer: SpanObserver);
    fn deregister_on_start_span(&self, observer: &SpanObserver);
}
