use std::time::Duration;

use super::{Shared, WorkerHook};
use super::sync::Arc;
use super::job::{CallKind, Priority};
use super::dispatcher::StationStats;
use super::shutdown::{Shutdown, ShutdownHandle};
use crate::error::{Result, StationError};
use crate::estimate::TimeSnapshot;
use crate::handle::JobHandle;
use crate::registry::Registry;

pub const DEFAULT_LOCAL_QUEUE_SIZE: u32 = 8;
pub const DEFAULT_WORKERS: u32 = 4;
/// In milliseconds.
pub const DEFAULT_FALLBACK_DURATION: f64 = 10.0;
pub const DEFAULT_WORKGROUP_SLICE: u32 = 64;

/// A reference to a station.
///
/// A station dispatches jobs to a fixed pool of execution units, each running
/// on its own thread. Jobs go to the unit with the smallest predicted backlog
/// that still has room in its local queue, and overflow to a global queue
/// otherwise.
///
/// The threads keep running until `shut_down` is called. Dropping every clone
/// of the station does not stop them: the control thread holds on to the
/// shared state, so a station that is never shut down leaks its execution
/// units and its control thread.
pub struct Station<Input, Output> {
    pub(crate) shared: Arc<Shared<Input, Output>>,
}

impl<Input, Output> Clone for Station<Input, Output> {
    fn clone(&self) -> Self {
        Station { shared: Arc::clone(&self.shared) }
    }
}

impl Station<(), ()> {
    pub fn builder() -> StationBuilder {
        StationBuilder {
            num_workers: default_workers(),
            local_queue_size: DEFAULT_LOCAL_QUEUE_SIZE,
            time_snapshot: None,
            fallback_duration: DEFAULT_FALLBACK_DURATION,
            workgroup_slice: DEFAULT_WORKGROUP_SLICE,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Station unit#{}", idx)),
            stack_size: None,
        }
    }
}

impl<Input, Output> Station<Input, Output> {
    /// Run a one-shot job.
    ///
    /// Blocks until the station is ready, then returns without waiting for the
    /// job to run.
    pub fn call(&self, name: &str, data: Input) -> Result<JobHandle<Output>> {
        self.shared.submit(name, data, CallKind::Simple, Priority::Low)
    }

    /// Run a workgroup job over `len` items.
    pub fn call_workgroup(&self, name: &str, data: Input, len: u32) -> Result<JobHandle<Output>> {
        self.shared.submit(name, data, CallKind::Workgroup { len }, Priority::Low)
    }

    /// Build a call with more parameters, such as the priority.
    pub fn job<'l>(&'l self, name: &'l str) -> CallBuilder<'l, Input, Output> {
        CallBuilder {
            station: self,
            name,
            priority: Priority::Low,
            kind: CallKind::Simple,
        }
    }

    /// Block until every execution unit has completed its handshake.
    pub fn wait_ready(&self) {
        self.shared.gate.wait();
    }

    /// Like `wait_ready`, but gives up after `timeout`. Returns whether the
    /// station is ready.
    pub fn wait_ready_timeout(&self, timeout: Duration) -> bool {
        self.shared.gate.wait_timeout(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.gate.is_open()
    }

    /// The current mean duration of every known job type.
    ///
    /// Includes seeded values that no job has overwritten yet.
    pub fn time_snapshot(&self) -> TimeSnapshot {
        self.shared.lock().time_snapshot()
    }

    pub fn stats(&self) -> StationStats {
        self.shared.lock().stats()
    }

    pub fn num_workers(&self) -> u32 { self.shared.num_workers }

    pub fn local_queue_size(&self) -> u32 { self.shared.local_queue_size }

    pub fn registry(&self) -> &Registry<Input, Output> {
        &self.shared.registry
    }

    pub fn shut_down(&self) -> ShutdownHandle {
        Shutdown::begin_shut_down(&self.shared)
    }
}

/// Parameters of a single call.
pub struct CallBuilder<'l, Input, Output> {
    station: &'l Station<Input, Output>,
    name: &'l str,
    priority: Priority,
    kind: CallKind,
}

impl<'l, Input, Output> CallBuilder<'l, Input, Output> {
    #[inline]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;

        self
    }

    /// Make this a workgroup call over `len` items.
    #[inline]
    pub fn with_workgroup(mut self, len: u32) -> Self {
        self.kind = CallKind::Workgroup { len };

        self
    }

    pub fn run(self, data: Input) -> Result<JobHandle<Output>> {
        self.station.shared.submit(self.name, data, self.kind, self.priority)
    }
}

pub struct StationBuilder {
    pub(crate) num_workers: u32,
    pub(crate) local_queue_size: u32,
    pub(crate) time_snapshot: Option<TimeSnapshot>,
    pub(crate) fallback_duration: f64,
    pub(crate) workgroup_slice: u32,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl StationBuilder {
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        self.name_handler = Box::new(handler);

        self
    }

    /// Set the size of the pool.
    ///
    /// The pool never has more workers than the machine has hardware threads
    /// minus one (leaving one for the caller), but always has at least one
    /// unless zero is requested, which `build` rejects.
    pub fn with_workers(mut self, num_workers: u32) -> Self {
        self.num_workers = num_workers.min(max_workers());

        self
    }

    /// How many jobs a worker may be running before further jobs overflow to
    /// the global queue.
    pub fn with_local_queue_size(mut self, size: u32) -> Self {
        self.local_queue_size = size;

        self
    }

    /// Seed the duration estimates, typically with a snapshot taken by a
    /// previous run.
    pub fn with_time_snapshot(mut self, snapshot: TimeSnapshot) -> Self {
        self.time_snapshot = Some(snapshot);

        self
    }

    /// The duration assumed for job types without an estimate, in milliseconds.
    pub fn with_fallback_duration(mut self, duration: f64) -> Self {
        self.fallback_duration = duration;

        self
    }

    /// How many workgroup items run between two checks for priority jobs.
    pub fn with_workgroup_slice(mut self, items: u32) -> Self {
        self.workgroup_slice = items.max(1);

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    pub fn build<Input, Output>(self, registry: Registry<Input, Output>) -> Result<Station<Input, Output>>
    where
        Input: Send + 'static,
        Output: Send + 'static,
    {
        if self.num_workers == 0 {
            return Err(StationError::NoWorkers);
        }
        if self.local_queue_size == 0 {
            return Err(StationError::ZeroLocalQueue);
        }
        if !self.fallback_duration.is_finite() || self.fallback_duration < 0.0 {
            return Err(StationError::InvalidFallback(self.fallback_duration));
        }

        crate::core::init(self, registry)
    }
}

fn max_workers() -> u32 {
    let hardware = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(DEFAULT_WORKERS + 1);

    hardware.saturating_sub(1).max(1)
}

fn default_workers() -> u32 {
    DEFAULT_WORKERS.min(max_workers())
}

#[cfg(test)]
fn test_registry() -> Registry<u64, u64> {
    let mut registry = Registry::new();
    registry.register("add", |x: u64| x + 1).unwrap();
    registry.register("sleep", |ms: u64| {
        std::thread::sleep(Duration::from_millis(ms));
        ms
    }).unwrap();
    registry.register_workgroup("sum", |x: &u64, i| x + i as u64, |a, b| a + b).unwrap();

    registry
}

#[test]
fn simple_calls() {
    let station = Station::builder()
        .with_workers(2)
        .build(test_registry())
        .unwrap();

    let handles: Vec<_> = (0..1000u64)
        .map(|i| station.call("add", i).unwrap())
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.resolve(), i as u64 + 1);
    }

    let stats = station.stats();
    assert_eq!(stats.completed, 1000);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.queued, 0);
    for worker in &stats.workers {
        assert_eq!(worker.running, 0);
    }

    station.shut_down().wait();
}

#[test]
fn workgroup_calls() {
    let station = Station::builder()
        .with_workers(2)
        .with_workgroup_slice(3)
        .build(test_registry())
        .unwrap();

    // 10 + 11 + ... + 19
    let handle = station.call_workgroup("sum", 10, 10).unwrap();
    assert_eq!(handle.resolve(), 145);

    let handle = station.job("sum")
        .with_workgroup(1)
        .with_priority(Priority::High)
        .run(5)
        .unwrap();
    assert_eq!(handle.resolve(), 5);

    station.shut_down().wait();
}

#[test]
fn call_validation() {
    let station = Station::builder()
        .with_workers(1)
        .build(test_registry())
        .unwrap();

    assert!(matches!(station.call("missing", 0), Err(StationError::UnknownJob(_))));
    assert!(matches!(station.call("sum", 0), Err(StationError::KindMismatch { .. })));
    assert!(matches!(station.call_workgroup("add", 0, 4), Err(StationError::KindMismatch { .. })));
    assert!(matches!(station.call_workgroup("sum", 0, 0), Err(StationError::EmptyWorkgroup(_))));

    // Rejected calls don't use up job ids.
    let handle = station.call("add", 1).unwrap();
    assert_eq!(handle.id().as_u64(), 0);
    assert_eq!(handle.resolve(), 2);

    station.shut_down().wait();
}

#[test]
fn builder_validation() {
    assert!(matches!(
        Station::builder().with_workers(0).build(test_registry()),
        Err(StationError::NoWorkers)
    ));
    assert!(matches!(
        Station::builder().with_local_queue_size(0).build(test_registry()),
        Err(StationError::ZeroLocalQueue)
    ));
    assert!(matches!(
        Station::builder().with_fallback_duration(f64::NAN).build(test_registry()),
        Err(StationError::InvalidFallback(_))
    ));
    assert!(matches!(
        Station::builder().with_fallback_duration(-1.0).build(test_registry()),
        Err(StationError::InvalidFallback(_))
    ));

    let builder = Station::builder().with_workers(10_000);
    assert!(builder.num_workers >= 1);
    assert!(builder.num_workers <= max_workers());
}

#[test]
fn calls_wait_for_readiness() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    static RELEASE: AtomicBool = AtomicBool::new(false);

    let station = Station::builder()
        .with_workers(1)
        .with_start_handler(|_| {
            while !RELEASE.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .build(test_registry())
        .unwrap();

    let caller = {
        let station = station.clone();
        thread::spawn(move || station.call("add", 41).unwrap().resolve())
    };

    thread::sleep(Duration::from_millis(30));
    assert!(!station.is_ready());
    assert!(!station.wait_ready_timeout(Duration::from_millis(5)));
    assert_eq!(station.stats().pending, 0);

    RELEASE.store(true, Ordering::Release);

    assert_eq!(caller.join().unwrap(), 42);
    assert!(station.is_ready());

    station.shut_down().wait();
}

#[test]
fn estimates_and_snapshot() {
    let snapshot: TimeSnapshot = [("add", 2.0), ("other", 3.0)].into_iter().collect();
    let station = Station::builder()
        .with_workers(1)
        .with_time_snapshot(snapshot)
        .build(test_registry())
        .unwrap();

    assert_eq!(station.time_snapshot().get("add"), Some(2.0));

    for ms in [4, 6, 5] {
        station.call("sleep", ms).unwrap().resolve();
    }

    // Estimates are folded in when the control thread is idle, which happens
    // right after the last completion since nothing else is going on.
    let mut mean = None;
    for _ in 0..200 {
        mean = station.time_snapshot().get("sleep");
        if station.stats().completed == 3 && mean.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let mean = mean.unwrap();
    assert!(mean >= 5.0, "mean {} should be at least 5ms", mean);
    assert_eq!(station.time_snapshot().get("other"), Some(3.0));

    station.shut_down().wait();
}

#[test]
fn overflow_then_drain() {
    let station = Station::builder()
        .with_workers(1)
        .with_local_queue_size(1)
        .build(test_registry())
        .unwrap();
    station.wait_ready();

    let slow = station.call("sleep", 50).unwrap();
    let queued: Vec<_> = (0..5).map(|i| station.call("add", i).unwrap()).collect();

    let stats = station.stats();
    assert_eq!(stats.workers[0].running, 1);
    assert_eq!(stats.queued, 5);

    // Priority jobs skip the queue.
    let urgent = station.job("add").with_priority(Priority::High).run(100).unwrap();
    assert_eq!(station.stats().workers[0].running, 2);
    assert_eq!(urgent.resolve(), 101);

    assert_eq!(slow.resolve(), 50);
    for (i, handle) in queued.into_iter().enumerate() {
        assert_eq!(handle.resolve(), i as u64 + 1);
    }

    let stats = station.stats();
    assert_eq!(stats.queued, 0);
    assert!(stats.reflows >= 1);

    station.shut_down().wait();
}

#[test]
fn queued_jobs_are_dropped_on_shutdown() {
    let station = Station::builder()
        .with_workers(1)
        .with_local_queue_size(1)
        .build(test_registry())
        .unwrap();

    let running = station.call("sleep", 30).unwrap();
    let queued = station.call("add", 1).unwrap();
    assert_eq!(station.stats().queued, 1);

    station.shut_down().wait();

    // Already admitted jobs still complete.
    assert_eq!(running.resolve(), 30);
    assert!(queued.resolve_timeout(Duration::from_millis(10)).is_err());
}
