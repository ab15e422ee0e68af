//! Execution units.
//!
//! Each unit is a dedicated thread with its own inbox. It never touches the
//! station's state: jobs arrive by value in `Outbound` messages and results
//! leave by value in `Inbound` messages.
//!
//! A unit keeps two local FIFO queues, one per priority. The high priority
//! queue is always drained first. Workgroup jobs are processed in slices of
//! items, and between slices a low priority workgroup checks its inbox and
//! runs any priority job that arrived in the meantime.

use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use crossbeam_deque::Worker as LocalQueue;

use crate::registry::{Handler, Registry};
use super::job::{Call, CallKind, Done, Inbound, Outbound, Priority};
use super::sync::Arc;
use super::UnitHooks;

pub(crate) struct Unit<Input, Output> {
    index: usize,
    inbox: Receiver<Outbound<Input>>,
    outbox: Sender<Inbound<Output>>,
    registry: Arc<Registry<Input, Output>>,
    hooks: Arc<UnitHooks>,
    queues: [LocalQueue<Call<Input>>; 2],
    // Jobs in the local queues, per priority.
    queued: [usize; 2],
    // Informed by the station during the handshake.
    local_queue_size: Option<u32>,
    workgroup_slice: u32,
    shutting_down: bool,
    stats: UnitStats,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct UnitStats {
    pub jobs_executed: u64,
    pub workgroup_items: u64,
    /// Number of priority jobs that ran in between the slices of a workgroup.
    pub preemptions: u64,
    /// Number of jobs received while the local queues already held
    /// `local_queue_size` jobs. Only priority jobs can do that.
    pub over_capacity: u64,
}

/// Reports `Exited` when the unit's thread stops, including when a handler
/// panics and unwinds through `Unit::run`.
struct ExitNotice<Output> {
    worker: usize,
    outbox: Sender<Inbound<Output>>,
}

impl<Output> Drop for ExitNotice<Output> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(worker = self.worker, "execution unit panicked");
        }

        // Nobody may be listening anymore at this point.
        let _ = self.outbox.send(Inbound::Exited { worker: self.worker });
    }
}

impl<Input, Output> Unit<Input, Output> {
    pub fn new(
        index: usize,
        inbox: Receiver<Outbound<Input>>,
        outbox: Sender<Inbound<Output>>,
        registry: Arc<Registry<Input, Output>>,
        hooks: Arc<UnitHooks>,
        workgroup_slice: u32,
    ) -> Self {
        Unit {
            index,
            inbox,
            outbox,
            registry,
            hooks,
            queues: [LocalQueue::new_fifo(), LocalQueue::new_fifo()],
            queued: [0, 0],
            local_queue_size: None,
            workgroup_slice: workgroup_slice.max(1),
            shutting_down: false,
            stats: UnitStats::default(),
        }
    }

    pub fn run(mut self) -> UnitStats {
        let _exit_notice = ExitNotice {
            worker: self.index,
            outbox: self.outbox.clone(),
        };

        if let Some(hook) = &self.hooks.start {
            hook.run(self.index as u32);
        }

        self.report(Inbound::Setup { worker: self.index });

        loop {
            self.drain_inbox();

            if let Some((call, priority)) = self.fetch_local_job() {
                self.execute(call, priority);
                continue;
            }

            if self.shutting_down {
                break;
            }

            // Nothing to do, block until the station sends something.
            match self.inbox.recv() {
                Ok(msg) => self.accept(msg),
                Err(_) => {
                    tracing::debug!(worker = self.index, "station is gone");
                    break;
                }
            }
        }

        if let Some(hook) = &self.hooks.exit {
            hook.run(self.index as u32);
        }

        tracing::debug!(worker = self.index, stats = ?self.stats, "execution unit exiting");

        self.stats
    }

    fn drain_inbox(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(msg) => self.accept(msg),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.shutting_down = true;
                    return;
                }
            }
        }
    }

    fn accept(&mut self, msg: Outbound<Input>) {
        match msg {
            Outbound::SetupAck { local_queue_size } => {
                tracing::trace!(worker = self.index, local_queue_size, "setup acknowledged");
                self.local_queue_size = Some(local_queue_size);
            }
            Outbound::Call(call) => self.enqueue(call, Priority::Low),
            Outbound::CallPriority(call) => self.enqueue(call, Priority::High),
            Outbound::Shutdown => {
                self.shutting_down = true;
            }
        }
    }

    fn enqueue(&mut self, call: Call<Input>, priority: Priority) {
        let idx = priority.index();
        self.queues[idx].push(call);
        self.queued[idx] += 1;

        if let Some(limit) = self.local_queue_size {
            let total = self.queued[0] + self.queued[1];
            if total > limit as usize {
                self.stats.over_capacity += 1;
                tracing::trace!(worker = self.index, queued = total, limit, "local queue over capacity");
            }
        }
    }

    fn fetch_local_job(&mut self) -> Option<(Call<Input>, Priority)> {
        for priority in [Priority::High, Priority::Low] {
            let idx = priority.index();
            if let Some(call) = self.queues[idx].pop() {
                self.queued[idx] -= 1;
                return Some((call, priority));
            }
        }

        None
    }

    fn execute(&mut self, call: Call<Input>, priority: Priority) {
        profiling::scope!("execute");

        let registry = Arc::clone(&self.registry);
        let Call { id, name, data, kind } = call;

        let start = Instant::now();
        let result = match (registry.get(&name), kind) {
            (Some(Handler::Simple(f)), CallKind::Simple) => f(data),
            (Some(Handler::Workgroup { item, reduce }), CallKind::Workgroup { len }) => {
                // Priority jobs don't get interrupted.
                let preemptible = priority == Priority::Low;
                self.run_workgroup(&data, len, item, reduce, preemptible)
            }
            _ => {
                // Calls are checked against the registry before they are
                // created, so this means the registry was swapped under us.
                tracing::error!(worker = self.index, job = id.0, %name, "no matching handler, dropping job");
                return;
            }
        };
        let observed = start.elapsed().as_secs_f64() * 1000.0;

        self.stats.jobs_executed += 1;
        self.report(Inbound::Done {
            worker: self.index,
            done: Done { id, name, result, observed },
        });
    }

    fn run_workgroup(
        &mut self,
        data: &Input,
        len: u32,
        item: &(dyn Fn(&Input, u32) -> Output + Send + Sync),
        reduce: &(dyn Fn(Output, Output) -> Output + Send + Sync),
        preemptible: bool,
    ) -> Output {
        debug_assert!(len > 0);

        let mut acc = item(data, 0);
        let mut start = 1;
        while start < len {
            if preemptible && start % self.workgroup_slice == 0 {
                self.run_priority_jobs();
            }

            let end = slice_end(start, self.workgroup_slice, len);
            for i in start..end {
                acc = reduce(acc, item(data, i));
            }
            start = end;
        }

        self.stats.workgroup_items += len as u64;

        acc
    }

    // Called between workgroup slices.
    fn run_priority_jobs(&mut self) {
        self.drain_inbox();

        let idx = Priority::High.index();
        while let Some(call) = self.queues[idx].pop() {
            self.queued[idx] -= 1;
            self.stats.preemptions += 1;
            self.execute(call, Priority::High);
        }
    }

    fn report(&mut self, msg: Inbound<Output>) {
        if self.outbox.send(msg).is_err() {
            tracing::warn!(worker = self.index, "station is gone, stopping");
            self.shutting_down = true;
        }
    }
}

/// End of the slice that contains `start`, clamped to `len`.
fn slice_end(start: u32, slice: u32, len: u32) -> u32 {
    start.saturating_add(slice - start % slice).min(len)
}

#[cfg(test)]
fn spawn_test_unit(
    registry: Registry<u32, u32>,
    workgroup_slice: u32,
) -> (Sender<Outbound<u32>>, Receiver<Inbound<u32>>, std::thread::JoinHandle<UnitStats>) {
    let (to_unit, inbox) = crossbeam_channel::unbounded();
    let (outbox, from_unit) = crossbeam_channel::unbounded();
    let hooks = Arc::new(UnitHooks { start: None, exit: None });
    let unit = Unit::new(0, inbox, outbox, Arc::new(registry), hooks, workgroup_slice);
    let thread = std::thread::spawn(move || unit.run());

    (to_unit, from_unit, thread)
}

#[cfg(test)]
fn test_call(id: u64, name: &str, data: u32, kind: CallKind) -> Call<u32> {
    Call { id: super::job::JobId(id), name: name.to_string(), data, kind }
}

#[test]
fn unit_protocol() {
    let mut registry = Registry::new();
    registry.register("double", |x: u32| x * 2).unwrap();
    registry.register_workgroup("sum", |x: &u32, i| x + i, |a, b| a + b).unwrap();

    let (tx, rx, thread) = spawn_test_unit(registry, 4);

    assert!(matches!(rx.recv().unwrap(), Inbound::Setup { worker: 0 }));
    tx.send(Outbound::SetupAck { local_queue_size: 8 }).unwrap();

    tx.send(Outbound::Call(test_call(0, "double", 21, CallKind::Simple))).unwrap();
    match rx.recv().unwrap() {
        Inbound::Done { worker: 0, done } => {
            assert_eq!(done.result, 42);
            assert_eq!(done.name, "double");
            assert!(done.observed >= 0.0);
        }
        other => panic!("unexpected message {:?}", other),
    }

    // sum(100 + i for i in 0..10)
    tx.send(Outbound::Call(test_call(1, "sum", 100, CallKind::Workgroup { len: 10 }))).unwrap();
    match rx.recv().unwrap() {
        Inbound::Done { done, .. } => assert_eq!(done.result, 1045),
        other => panic!("unexpected message {:?}", other),
    }

    tx.send(Outbound::Shutdown).unwrap();
    assert!(matches!(rx.recv().unwrap(), Inbound::Exited { worker: 0 }));
    thread.join().unwrap();
}

#[test]
fn priority_jobs_run_first() {
    use std::sync::atomic::{AtomicBool, Ordering};

    static STARTED: AtomicBool = AtomicBool::new(false);
    static RELEASE: AtomicBool = AtomicBool::new(false);

    let mut registry = Registry::new();
    registry.register("block", |x: u32| {
        STARTED.store(true, Ordering::Release);
        while !RELEASE.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        x
    }).unwrap();
    registry.register("id", |x: u32| x).unwrap();

    let (tx, rx, thread) = spawn_test_unit(registry, 4);
    assert!(matches!(rx.recv().unwrap(), Inbound::Setup { .. }));
    tx.send(Outbound::SetupAck { local_queue_size: 2 }).unwrap();

    // Keep the unit busy while the rest of the calls pile up in its queues.
    tx.send(Outbound::Call(test_call(0, "block", 0, CallKind::Simple))).unwrap();
    while !STARTED.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    tx.send(Outbound::Call(test_call(1, "id", 1, CallKind::Simple))).unwrap();
    tx.send(Outbound::Call(test_call(2, "id", 2, CallKind::Simple))).unwrap();
    tx.send(Outbound::CallPriority(test_call(3, "id", 3, CallKind::Simple))).unwrap();
    tx.send(Outbound::Shutdown).unwrap();
    RELEASE.store(true, Ordering::Release);

    let mut order = Vec::new();
    loop {
        match rx.recv().unwrap() {
            Inbound::Done { done, .. } => order.push(done.result),
            Inbound::Exited { .. } => break,
            other => panic!("unexpected message {:?}", other),
        }
    }
    let stats = thread.join().unwrap();

    // Shutting down still runs everything that was queued.
    assert_eq!(order, vec![0, 3, 1, 2]);
    assert_eq!(stats.jobs_executed, 4);
    // The priority job arrived on top of two queued jobs.
    assert_eq!(stats.over_capacity, 1);
    assert_eq!(stats.preemptions, 0);
}

#[test]
fn workgroup_slices_let_priority_jobs_in() {
    use std::sync::atomic::{AtomicBool, Ordering};

    static STARTED: AtomicBool = AtomicBool::new(false);
    static PRIORITY_SENT: AtomicBool = AtomicBool::new(false);

    let mut registry = Registry::new();
    registry.register_workgroup("wait", |_: &u32, i| {
        // The first slice waits for the priority job to be sent.
        if i == 0 {
            STARTED.store(true, Ordering::Release);
            while !PRIORITY_SENT.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        }
        1
    }, |a, b| a + b).unwrap();
    registry.register("id", |x: u32| x).unwrap();

    let (tx, rx, thread) = spawn_test_unit(registry, 2);
    assert!(matches!(rx.recv().unwrap(), Inbound::Setup { .. }));

    tx.send(Outbound::Call(test_call(0, "wait", 0, CallKind::Workgroup { len: 6 }))).unwrap();
    while !STARTED.load(Ordering::Acquire) {
        std::thread::yield_now();
    }
    tx.send(Outbound::CallPriority(test_call(1, "id", 7, CallKind::Simple))).unwrap();
    PRIORITY_SENT.store(true, Ordering::Release);

    let first = match rx.recv().unwrap() {
        Inbound::Done { done, .. } => done,
        other => panic!("unexpected message {:?}", other),
    };
    let second = match rx.recv().unwrap() {
        Inbound::Done { done, .. } => done,
        other => panic!("unexpected message {:?}", other),
    };

    // The priority job finished while the workgroup was still running.
    assert_eq!(first.result, 7);
    assert_eq!(second.result, 6);

    tx.send(Outbound::Shutdown).unwrap();
    assert!(matches!(rx.recv().unwrap(), Inbound::Exited { .. }));
    thread.join().unwrap();
}

#[test]
fn workgroup_slice_bounds() {
    assert_eq!(slice_end(1, 4, 10), 4);
    assert_eq!(slice_end(4, 4, 10), 8);
    assert_eq!(slice_end(8, 4, 10), 10);
    assert_eq!(slice_end(1, 64, 3), 3);

    // Large slices and lengths must not wrap around.
    let half = 1u32 << 31;
    assert_eq!(slice_end(half, half, u32::MAX), u32::MAX);
    assert_eq!(slice_end(u32::MAX - 1, 8, u32::MAX), u32::MAX);
    assert_eq!(slice_end(1, u32::MAX, u32::MAX), u32::MAX);
}

#[test]
fn panicking_handler_still_reports_exit() {
    let mut registry = Registry::new();
    registry.register("boom", |_: u32| -> u32 { panic!("handler failure") }).unwrap();

    let (tx, rx, thread) = spawn_test_unit(registry, 4);
    assert!(matches!(rx.recv().unwrap(), Inbound::Setup { worker: 0 }));

    tx.send(Outbound::Call(test_call(0, "boom", 0, CallKind::Simple))).unwrap();

    assert!(matches!(rx.recv().unwrap(), Inbound::Exited { worker: 0 }));
    assert!(thread.join().is_err());
}
