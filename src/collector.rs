use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::cpu_time::ThreadCpuTime;
use crate::error::ConfigError;
use crate::event::SampleEvent;
use crate::profiler_threads;
use crate::runtime::{
    current_thread_id, native_thread_id, FrameObject, ThreadRegistry, ThreadTable,
};
use crate::span_links::ThreadSpanLinks;
use crate::symbolize::Symbolizer;
use crate::tracer::{SpanObserver, Tracer};
use crate::walker::{run_pass, PassContext};

/// Smallest sleep between two sampling passes.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Name of the dedicated sampler thread, as spawned and as registered with
/// the runtime's thread registry.
pub const SAMPLER_THREAD_NAME: &str = "stackpulse-sampler";

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Upper bound on the fraction of wall time the sampler may consume,
    /// in percent. Must be greater than 0 and at most 100.
    pub max_time_usage_pct: f64,
    /// Stack depth carried per event; deeper stacks are truncated by the
    /// symbolizer.
    pub max_nframes: usize,
    /// Exclude the profiler's own threads from the event stream.
    pub ignore_profiler: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            max_time_usage_pct: 2.0,
            max_nframes: 64,
            ignore_profiler: true,
        }
    }
}

impl SamplerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_time_usage_pct > 0.0 && self.max_time_usage_pct <= 100.0) {
            return Err(ConfigError::InvalidMaxTimeUsagePct(self.max_time_usage_pct));
        }
        if self.max_nframes == 0 {
            return Err(ConfigError::InvalidMaxNframes);
        }
        Ok(())
    }
}

/// Totals for one sampler run, returned by [`RunningSampler::stop`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SamplerStats {
    pub passes: u64,
    pub stack_events: u64,
    pub exception_events: u64,
}

/// A started profiler: a dedicated OS-level sampler thread that
/// periodically walks the runtime's threads and delivers sample events to
/// the channel given at start.
///
/// The sampler must be a real OS thread, never a cooperative fiber: it has
/// to keep running while user threads are CPU-bound and not yielding. The
/// sleep between passes stretches so that sampling stays within the
/// configured wall-time budget.
pub struct RunningSampler {
    stop_flag: Arc<AtomicBool>,
    sampler_thread: JoinHandle<SamplerStats>,
    tracer: Option<(Arc<dyn Tracer>, SpanObserver)>,
}

impl RunningSampler {
    /// Validate `config`, wire the span-start observer into `tracer` (when
    /// one is given), and launch the sampler thread.
    pub fn start(
        config: SamplerConfig,
        table: Arc<ThreadTable>,
        registry: Arc<ThreadRegistry>,
        symbolizer: Arc<dyn Symbolizer>,
        tracer: Option<Arc<dyn Tracer>>,
        events: Sender<SampleEvent>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let span_links = tracer.as_ref().map(|_| Arc::new(ThreadSpanLinks::new()));
        let tracer = match (tracer, &span_links) {
            (Some(tracer), Some(links)) => {
                let links = Arc::clone(links);
                let observer: SpanObserver = Arc::new(move |span| links.link_span(&span));
                tracer.on_start_span(Arc::clone(&observer));
                Some((tracer, observer))
            }
            _ => None,
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        let sampler_loop = SamplerLoop {
            config,
            table,
            registry,
            symbolizer,
            span_links,
            events,
            stop_flag: Arc::clone(&stop_flag),
        };
        let sampler_thread = thread::Builder::new()
            .name(SAMPLER_THREAD_NAME.to_owned())
            .spawn(move || sampler_loop.run())
            .expect("couldn't spawn sampler thread");

        Ok(RunningSampler {
            stop_flag,
            sampler_thread,
            tracer,
        })
    }

    /// Stop the sampler thread and deregister the span-start observer.
    /// Blocks until the thread has finished its current pass and sleep.
    pub fn stop(self) -> SamplerStats {
        self.stop_flag.store(true, Ordering::SeqCst);
        let stats = self
            .sampler_thread
            .join()
            .expect("couldn't join sampler thread");
        if let Some((tracer, observer)) = self.tracer {
            tracer.deregister_on_start_span(&observer);
        }
        stats
    }
}

struct SamplerLoop {
    config: SamplerConfig,
    table: Arc<ThreadTable>,
    registry: Arc<ThreadRegistry>,
    symbolizer: Arc<dyn Symbolizer>,
    span_links: Option<Arc<ThreadSpanLinks>>,
    events: Sender<SampleEvent>,
    stop_flag: Arc<AtomicBool>,
}

impl SamplerLoop {
    fn run(self) -> SamplerStats {
        let tid = current_thread_id();

        // The sampler is a thread of the hosting process like any other,
        // so it shows up in the runtime's own bookkeeping. Registering it
        // here is what lets `ignore_profiler` filter it back out.
        let table_handle = self.table.attach_current_thread();
        table_handle.set_frame(Arc::new(FrameObject {
            function: "sampler_loop".into(),
            filename: "<stackpulse>".into(),
            lineno: 0,
            back: None,
        }));
        self.registry
            .register(tid, SAMPLER_THREAD_NAME, native_thread_id());
        profiler_threads::register(tid);
        log::debug!("sampler thread started (tid {tid})");

        let mut stats = SamplerStats::default();
        let mut thread_time = ThreadCpuTime::new();
        let mut interval_s = MIN_INTERVAL.as_secs_f64();
        let mut last_wall = Instant::now();
        let mut last_sleep_overshoot = Duration::ZERO;

        while !self.stop_flag.load(Ordering::SeqCst) {
            let pass_start = Instant::now();
            let wall_time_ns = pass_start.duration_since(last_wall).as_nanos() as u64;
            last_wall = pass_start;

            let pass = run_pass(PassContext {
                table: &self.table,
                registry: &self.registry,
                symbolizer: self.symbolizer.as_ref(),
                thread_time: &mut thread_time,
                span_links: self.span_links.as_deref(),
                ignore_profiler: self.config.ignore_profiler,
                max_nframes: self.config.max_nframes,
                interval_s,
                wall_time_ns,
            });
            stats.passes += 1;

            let pass_cost = pass_start.elapsed();
            interval_s = interval_after_pass(pass_cost, self.config.max_time_usage_pct);

            match pass {
                Ok(output) => {
                    stats.stack_events += output.stacks.len() as u64;
                    stats.exception_events += output.exceptions.len() as u64;
                    let events = output
                        .stacks
                        .into_iter()
                        .map(SampleEvent::Stack)
                        .chain(output.exceptions.into_iter().map(SampleEvent::Exception));
                    let mut receiver_gone = false;
                    for event in events {
                        if self.events.send(event).is_err() {
                            receiver_gone = true;
                            break;
                        }
                    }
                    if receiver_gone {
                        // Nobody is listening anymore; no point sampling.
                        break;
                    }
                }
                Err(err) => {
                    // The pass is lost but no state is: retry on the next
                    // iteration.
                    log::warn!("sampling pass aborted: {err}");
                }
            }

            let sleep_time = Duration::from_secs_f64(interval_s)
                .saturating_sub(last_sleep_overshoot)
                .max(MIN_INTERVAL);
            sleep_and_save_overshoot(sleep_time, &mut last_sleep_overshoot);
        }

        profiler_threads::deregister(tid);
        self.registry.deregister(tid);
        drop(table_handle);
        log::debug!(
            "sampler thread exiting after {} passes ({} stack events, {} exception events)",
            stats.passes,
            stats.stack_events,
            stats.exception_events
        );
        stats
    }
}

/// The sleep that keeps the sampler within its time budget: if the pass
/// cost `used` and the permitted fraction is `f`, the next sleep `s` must
/// satisfy `used / (used + s) = f`, giving `s = used / f - used`.
fn interval_after_pass(pass_cost: Duration, max_time_usage_pct: f64) -> f64 {
    let used_s = pass_cost.as_secs_f64();
    let fraction = max_time_usage_pct / 100.0;
    (used_s / fraction - used_s).max(MIN_INTERVAL.as_secs_f64())
}

fn sleep_and_save_overshoot(duration: Duration, overshoot: &mut Duration) {
    let before_sleep = Instant::now();
    thread::sleep(duration);
    *overshoot = before_sleep.elapsed().saturating_sub(duration);
}
