//! End-to-end tests driving a fake hosted runtime through the sampler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use stackpulse::runtime::{
    native_thread_id, FrameObject, PendingException, ThreadRegistry, ThreadStateHandle,
    ThreadTable, TracebackObject,
};
use stackpulse::symbolize::ChainSymbolizer;
use stackpulse::tracer::{Span, SpanObserver, Tracer};
use stackpulse::{
    ConfigError, RunningSampler, SampleEvent, SamplerConfig, StackSampleEvent,
    SAMPLER_THREAD_NAME,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a frame chain, outermost function first; the returned frame is
/// the innermost one.
fn frame_chain(functions: &[&str]) -> Arc<FrameObject> {
    let mut frame: Option<Arc<FrameObject>> = None;
    for function in functions {
        frame = Some(Arc::new(FrameObject {
            function: (*function).into(),
            filename: "app.rs".into(),
            lineno: 1,
            back: frame,
        }));
    }
    frame.expect("at least one function")
}

enum Command {
    Run(Box<dyn FnOnce(&ThreadStateHandle) + Send>),
    Exit,
}

/// A thread hosted by the fake runtime: attaches to the thread table,
/// registers itself, publishes a frame, and then executes commands against
/// its own table handle until told to exit.
struct HostedThread {
    commands: Sender<Command>,
    join: JoinHandle<()>,
}

impl HostedThread {
    fn spawn(
        table: &Arc<ThreadTable>,
        registry: &Arc<ThreadRegistry>,
        name: &'static str,
        busy: bool,
    ) -> Self {
        let table = Arc::clone(table);
        let registry = Arc::clone(registry);
        let (command_sender, command_receiver) = crossbeam_channel::unbounded::<Command>();
        let (ready_sender, ready_receiver) = crossbeam_channel::bounded::<()>(1);
        let join = std::thread::spawn(move || {
            let handle = table.attach_current_thread();
            registry.register(handle.tid(), name, native_thread_id());
            handle.set_frame(frame_chain(&["entry_point", name]));
            ready_sender.send(()).unwrap();

            if busy {
                // Spin while polling for commands, so CPU time accrues.
                loop {
                    match command_receiver.try_recv() {
                        Ok(Command::Run(f)) => f(&handle),
                        Ok(Command::Exit) => break,
                        Err(_) => {
                            for _ in 0..10_000 {
                                std::hint::black_box(1u64.wrapping_mul(3));
                            }
                        }
                    }
                }
            } else {
                while let Ok(command) = command_receiver.recv() {
                    match command {
                        Command::Run(f) => f(&handle),
                        Command::Exit => break,
                    }
                }
            }

            registry.deregister(handle.tid());
        });
        ready_receiver.recv().unwrap();
        HostedThread {
            commands: command_sender,
            join,
        }
    }

    /// Execute `f` on the hosted thread, against its table handle, and
    /// wait for it to finish.
    fn run(&self, f: impl FnOnce(&ThreadStateHandle) + Send + 'static) {
        let (done_sender, done_receiver) = crossbeam_channel::bounded::<()>(1);
        self.commands
            .send(Command::Run(Box::new(move |handle| {
                f(handle);
                done_sender.send(()).unwrap();
            })))
            .unwrap();
        done_receiver.recv().unwrap();
    }

    fn finish(self) {
        self.commands.send(Command::Exit).unwrap();
        self.join.join().unwrap();
    }
}

struct FakeTracer {
    observers: Mutex<Vec<SpanObserver>>,
}

impl FakeTracer {
    fn new() -> Arc<Self> {
        Arc::new(FakeTracer {
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Start a span on the calling thread, notifying every observer the
    /// way a real tracer does.
    fn start_span(&self, span: Arc<dyn Span>) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer(Arc::clone(&span));
        }
    }

    fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl Tracer for FakeTracer {
    fn on_start_span(&self, observer: SpanObserver) {
        self.observers.lock().push(observer);
    }

    fn deregister_on_start_span(&self, observer: &SpanObserver) {
        self.observers
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }
}

struct TestSpan {
    trace_id: u64,
    finished: AtomicBool,
}

impl TestSpan {
    fn new(trace_id: u64) -> Arc<Self> {
        Arc::new(TestSpan {
            trace_id,
            finished: AtomicBool::new(false),
        })
    }
}

impl Span for TestSpan {
    fn trace_id(&self) -> u64 {
        self.trace_id
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn parent(&self) -> Option<Arc<dyn Span>> {
        None
    }
}

fn start_sampler(
    table: &Arc<ThreadTable>,
    registry: &Arc<ThreadRegistry>,
    config: SamplerConfig,
    tracer: Option<Arc<dyn Tracer>>,
) -> (RunningSampler, Receiver<SampleEvent>) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let sampler = RunningSampler::start(
        config,
        Arc::clone(table),
        Arc::clone(registry),
        Arc::new(ChainSymbolizer),
        tracer,
        sender,
    )
    .expect("valid config");
    (sampler, receiver)
}

/// Receive events until one matches, or panic at the deadline.
fn wait_for_stack_event(
    receiver: &Receiver<SampleEvent>,
    mut predicate: impl FnMut(&StackSampleEvent) -> bool,
) -> StackSampleEvent {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for a matching stack event");
        match receiver.recv_timeout(remaining) {
            Ok(SampleEvent::Stack(event)) if predicate(&event) => return event,
            Ok(_) => continue,
            Err(err) => panic!("event channel closed or timed out: {err}"),
        }
    }
}

fn drain(receiver: &Receiver<SampleEvent>) {
    while receiver.try_recv().is_ok() {}
}

fn event_thread_name(event: &SampleEvent) -> &str {
    match event {
        SampleEvent::Stack(e) => &e.thread_name,
        SampleEvent::Exception(e) => &e.thread_name,
    }
}

#[test]
fn hosted_threads_show_up_in_the_event_stream() {
    let _ = env_logger::builder().is_test(true).try_init();
    let table = Arc::new(ThreadTable::new());
    let registry = Arc::new(ThreadRegistry::with_bootstrap_thread(0));
    let worker = HostedThread::spawn(&table, &registry, "worker-0", false);

    let (sampler, receiver) = start_sampler(&table, &registry, SamplerConfig::default(), None);

    let event = wait_for_stack_event(&receiver, |e| e.thread_name == "worker-0");
    assert_eq!(event.frames[0].function, "worker-0");
    assert_eq!(event.frames[1].function, "entry_point");
    assert_eq!(event.nframes, 2);
    assert!(event.sampling_period_ns >= 10_000_000);
    assert!(event.trace_ids.is_empty());

    let stats = sampler.stop();
    assert!(stats.passes >= 1);
    assert!(stats.stack_events >= 1);
    worker.finish();
}

#[test]
fn wall_time_is_contiguous_across_passes() {
    let table = Arc::new(ThreadTable::new());
    let registry = Arc::new(ThreadRegistry::with_bootstrap_thread(0));
    let worker = HostedThread::spawn(&table, &registry, "wall-clock", false);

    let started = Instant::now();
    let (sampler, receiver) = start_sampler(&table, &registry, SamplerConfig::default(), None);

    let mut wall_sum = 0u64;
    for _ in 0..5 {
        let event = wait_for_stack_event(&receiver, |e| e.thread_name == "wall-clock");
        wall_sum += event.wall_time_ns;
    }
    let elapsed = started.elapsed().as_nanos() as u64;

    // Wall deltas chain one pass to the next, so their sum cannot exceed
    // the elapsed time over the same window.
    assert!(wall_sum > 0);
    assert!(wall_sum <= elapsed + Duration::from_millis(50).as_nanos() as u64);

    sampler.stop();
    worker.finish();
}

#[test]
fn sampler_samples_itself_only_when_not_ignored() {
    let table = Arc::new(ThreadTable::new());
    let registry = Arc::new(ThreadRegistry::with_bootstrap_thread(0));

    let config = SamplerConfig {
        ignore_profiler: false,
        ..SamplerConfig::default()
    };
    let (sampler, receiver) = start_sampler(&table, &registry, config, None);
    let own = wait_for_stack_event(&receiver, |e| e.thread_name == SAMPLER_THREAD_NAME);
    assert_eq!(own.frames[0].function, "sampler_loop");
    sampler.stop();
}

#[test]
fn sampler_thread_never_appears_with_default_config() {
    let table = Arc::new(ThreadTable::new());
    let registry = Arc::new(ThreadRegistry::with_bootstrap_thread(0));
    let worker = HostedThread::spawn(&table, &registry, "only-me", false);

    let (sampler, receiver) = start_sampler(&table, &registry, SamplerConfig::default(), None);

    let deadline = Instant::now() + EVENT_TIMEOUT;
    let mut seen = 0;
    while seen < 20 && Instant::now() < deadline {
        if let Ok(event) = receiver.recv_timeout(Duration::from_millis(100)) {
            seen += 1;
            assert_ne!(event_thread_name(&event), SAMPLER_THREAD_NAME);
        }
    }
    assert!(seen > 0);
    sampler.stop();
    worker.finish();
}

#[test]
fn span_correlation_follows_the_span_lifecycle() {
    let table = Arc::new(ThreadTable::new());
    let registry = Arc::new(ThreadRegistry::with_bootstrap_thread(0));
    let tracer = FakeTracer::new();
    let tracer_dyn: Arc<dyn Tracer> = tracer.clone();
    let worker = HostedThread::spawn(&table, &registry, "traced", false);

    let (sampler, receiver) = start_sampler(
        &table,
        &registry,
        SamplerConfig::default(),
        Some(tracer_dyn),
    );
    assert_eq!(tracer.observer_count(), 1);

    // Start a span from the traced thread; samples pick up its trace id.
    let span = TestSpan::new(4242);
    let span_for_worker: Arc<dyn Span> = span.clone();
    let tracer_for_worker = tracer.clone();
    worker.run(move |_handle| tracer_for_worker.start_span(span_for_worker));
    let event = wait_for_stack_event(&receiver, |e| {
        e.thread_name == "traced" && !e.trace_ids.is_empty()
    });
    assert!(event.trace_ids.contains(&4242));

    // Finish the span; samples stop carrying it. (A pass in flight at the
    // moment of finishing may still carry the id, so wait for the stream
    // to settle rather than inspecting the very next event.)
    span.finished.store(true, Ordering::SeqCst);
    drain(&receiver);
    wait_for_stack_event(&receiver, |e| e.thread_name == "traced" && e.trace_ids.is_empty());

    // Drop the last strong reference; nothing resurrects it.
    drop(span);
    drain(&receiver);
    wait_for_stack_event(&receiver, |e| e.thread_name == "traced" && e.trace_ids.is_empty());

    sampler.stop();
    // Stopping deregistered the observer.
    assert_eq!(tracer.observer_count(), 0);
    worker.finish();
}

#[test]
fn in_flight_exceptions_are_sampled() {
    let table = Arc::new(ThreadTable::new());
    let registry = Arc::new(ThreadRegistry::with_bootstrap_thread(0));
    let worker = HostedThread::spawn(&table, &registry, "thrower", false);

    worker.run(|handle| {
        handle.set_pending_exception(PendingException {
            exc_type: "DeadlineExceeded".into(),
            traceback: Some(Arc::new(TracebackObject {
                frame: frame_chain(&["entry_point", "raise_site"]),
                lineno: 7,
                next: None,
            })),
        });
    });

    let (sampler, receiver) = start_sampler(&table, &registry, SamplerConfig::default(), None);

    let deadline = Instant::now() + EVENT_TIMEOUT;
    let mut found = None;
    while Instant::now() < deadline {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(SampleEvent::Exception(event)) if event.thread_name == "thrower" => {
                found = Some(event);
                break;
            }
            _ => continue,
        }
    }
    sampler.stop();

    let event = found.expect("no exception event observed");
    assert_eq!(event.exc_type, "DeadlineExceeded");
    assert_eq!(event.frames[0].function, "raise_site");
    assert_eq!(event.nframes, 2);

    // Once the exception is handled, exception events stop.
    worker.run(|handle| handle.clear_pending_exception());
    let (sampler, receiver) = start_sampler(&table, &registry, SamplerConfig::default(), None);
    let observation_end = Instant::now() + Duration::from_millis(300);
    while Instant::now() < observation_end {
        if let Ok(SampleEvent::Exception(event)) =
            receiver.recv_timeout(Duration::from_millis(50))
        {
            panic!("unexpected exception event for {}", event.thread_name);
        }
    }
    sampler.stop();
    worker.finish();
}

#[test]
fn dead_threads_stop_appearing() {
    let table = Arc::new(ThreadTable::new());
    let registry = Arc::new(ThreadRegistry::with_bootstrap_thread(0));
    let doomed = HostedThread::spawn(&table, &registry, "doomed", false);

    let (sampler, receiver) = start_sampler(&table, &registry, SamplerConfig::default(), None);
    wait_for_stack_event(&receiver, |e| e.thread_name == "doomed");

    // Kill the thread; its table entry detaches on exit.
    doomed.finish();

    // Let in-flight passes finish, then require silence.
    std::thread::sleep(Duration::from_millis(200));
    drain(&receiver);
    let observation_end = Instant::now() + Duration::from_millis(300);
    while Instant::now() < observation_end {
        if let Ok(event) = receiver.recv_timeout(Duration::from_millis(50)) {
            assert_ne!(event_thread_name(&event), "doomed");
        }
    }
    sampler.stop();
}

#[test]
fn rejects_invalid_time_budgets() {
    let table = Arc::new(ThreadTable::new());
    let registry = Arc::new(ThreadRegistry::with_bootstrap_thread(0));
    let (sender, _receiver) = crossbeam_channel::unbounded();

    for pct in [0.0, -1.0, 150.0] {
        let result = RunningSampler::start(
            SamplerConfig {
                max_time_usage_pct: pct,
                ..SamplerConfig::default()
            },
            Arc::clone(&table),
            Arc::clone(&registry),
            Arc::new(ChainSymbolizer),
            None,
            sender.clone(),
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidMaxTimeUsagePct(_))
        ));
    }
}

#[cfg(target_os = "linux")]
#[test]
fn busy_threads_are_charged_more_cpu_than_idle_ones() {
    let table = Arc::new(ThreadTable::new());
    let registry = Arc::new(ThreadRegistry::with_bootstrap_thread(0));
    let busy = HostedThread::spawn(&table, &registry, "busy", true);
    let idle = HostedThread::spawn(&table, &registry, "idle", false);

    let (sampler, receiver) = start_sampler(
        &table,
        &registry,
        SamplerConfig {
            max_time_usage_pct: 10.0,
            ..SamplerConfig::default()
        },
        None,
    );

    let mut busy_cpu = 0u64;
    let mut idle_cpu = 0u64;
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Ok(SampleEvent::Stack(event)) = receiver.recv_timeout(Duration::from_millis(100)) {
            match event.thread_name.as_str() {
                "busy" => busy_cpu += event.cpu_time_ns,
                "idle" => idle_cpu += event.cpu_time_ns,
                _ => {}
            }
        }
    }
    sampler.stop();
    busy.finish();
    idle.finish();

    assert!(busy_cpu > 0, "busy thread accrued no CPU time");
    assert!(
        busy_cpu > idle_cpu,
        "busy thread ({busy_cpu} ns) should out-consume the idle one ({idle_cpu} ns)"
    );
}
