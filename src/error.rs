use thiserror::Error;

/// Rejected configuration. Returned by [`RunningSampler::start`] before any
/// thread is spawned.
///
/// [`RunningSampler::start`]: crate::RunningSampler::start
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max_time_usage_pct must be greater than 0 and at most 100, got {0}")]
    InvalidMaxTimeUsagePct(f64),

    #[error("max_nframes must be greater than 0")]
    InvalidMaxNframes,
}

/// Error from converting a raw frame or traceback into symbolic frames.
///
/// A symbolization error aborts the sampling pass that encountered it; the
/// sampler keeps its state and retries on the next pass.
#[derive(Debug, Clone, Error)]
pub enum SymbolizeError {
    #[error("malformed frame object: {0}")]
    MalformedFrame(&'static str),

    #[error("malformed traceback object: {0}")]
    MalformedTraceback(&'static str),
}
