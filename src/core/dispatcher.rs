//! The dispatcher owns all of the station's scheduling state: the worker
//! handles, the estimate table, the global queue and the pending-job map.
//!
//! It has no threads of its own. The station keeps it behind a single mutex
//! so that admission (from calling threads) and completion handling (from the
//! control thread) are each applied as one step.
//!
//! Admission picks the eligible worker with the smallest estimated backlog,
//! where the backlog of a worker is the sum of the *predicted* durations of
//! the jobs it is running. A job's prediction is taken once, at admission, and
//! the same value is subtracted when it completes. Observed durations only
//! feed the estimate table, in batches, when the control thread is idle.

use std::collections::{HashMap, VecDeque};

use crossbeam_channel::Sender;

use crate::coalesce::Coalesce;
use crate::estimate::{EstimateTable, TimeSnapshot};
use crate::handle::{job_handle, JobHandle, Resolver};
use super::job::{Call, CallKind, Done, JobId, Outbound, Priority};
use super::sync::Arc;
use super::worker::{WorkerHandle, WorkerStatus};

/// A snapshot of the station's bookkeeping, for debugging and monitoring.
#[derive(Clone, Debug)]
pub struct StationStats {
    pub workers: Vec<WorkerStatus>,
    /// Jobs waiting in the global queue.
    pub queued: usize,
    /// Jobs submitted and not completed yet, queued or running.
    pub pending: usize,
    pub completed: u64,
    /// Number of reflow passes that ran.
    pub reflows: u64,
}

struct Pending<Output> {
    resolver: Resolver<Output>,
    // Set once the job is sent to a worker. None while in the global queue.
    admitted: Option<Admission>,
}

#[derive(Copy, Clone, Debug)]
struct Admission {
    worker: usize,
    estimate: f64,
}

pub(crate) struct Dispatcher<Input, Output> {
    workers: Vec<WorkerHandle<Input>>,
    estimates: EstimateTable,
    global_queue: VecDeque<Call<Input>>,
    pending: HashMap<JobId, Pending<Output>>,
    // Observed durations waiting to be folded into the estimate table.
    samples: Vec<(String, f64)>,
    update_estimates: Arc<Coalesce>,
    reflow: Arc<Coalesce>,
    local_queue_size: u32,
    next_id: u64,
    completed: u64,
}

impl<Input, Output> Dispatcher<Input, Output> {
    pub fn new(
        units: Vec<Sender<Outbound<Input>>>,
        local_queue_size: u32,
        estimates: EstimateTable,
    ) -> Self {
        debug_assert!(!units.is_empty());
        debug_assert!(local_queue_size > 0);

        Dispatcher {
            workers: units.into_iter()
                .enumerate()
                .map(|(index, sender)| WorkerHandle::new(index, sender))
                .collect(),
            estimates,
            global_queue: VecDeque::new(),
            pending: HashMap::new(),
            samples: Vec::new(),
            update_estimates: Arc::new(Coalesce::new("update estimates")),
            reflow: Arc::new(Coalesce::new("reflow")),
            local_queue_size,
            next_id: 0,
            completed: 0,
        }
    }

    pub fn num_workers(&self) -> usize { self.workers.len() }

    /// Create a job and admit it, or append it to the global queue if no
    /// worker can take it.
    pub fn submit(&mut self, name: String, data: Input, kind: CallKind, priority: Priority) -> JobHandle<Output> {
        profiling::scope!("submit");

        let id = JobId(self.next_id);
        self.next_id += 1;

        let (resolver, handle) = job_handle(id);
        self.pending.insert(id, Pending { resolver, admitted: None });

        let call = Call { id, name, data, kind };
        if let Err(call) = self.try_admit(call, priority) {
            tracing::debug!(job = id.0, name = %call.name, queued = self.global_queue.len() + 1, "no worker available, job queued");
            self.global_queue.push_back(call);
        }

        handle
    }

    /// Select the worker a job of this priority would be admitted to.
    ///
    /// Priority jobs may go to any worker. Other jobs only to workers that
    /// have fewer than `local_queue_size` running jobs. Among those, the one
    /// with the smallest backlog wins, ties going to the lowest index.
    fn select_worker(&self, priority: Priority) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, worker) in self.workers.iter().enumerate() {
            if priority == Priority::Low && worker.running() >= self.local_queue_size {
                continue;
            }

            match best {
                Some((_, backlog)) if worker.backlog() >= backlog => {}
                _ => best = Some((idx, worker.backlog())),
            }
        }

        best.map(|(idx, _)| idx)
    }

    /// Hands the call back if no worker is eligible.
    fn try_admit(&mut self, call: Call<Input>, priority: Priority) -> Result<(), Call<Input>> {
        let worker = match self.select_worker(priority) {
            Some(idx) => idx,
            None => return Err(call),
        };

        let estimate = self.estimates.lookup(&call.name);
        if let Some(pending) = self.pending.get_mut(&call.id) {
            pending.admitted = Some(Admission { worker, estimate });
        }

        tracing::trace!(job = call.id.0, name = %call.name, worker, estimate, ?priority, "admitted");
        self.workers[worker].admit(call, priority, estimate);

        Ok(())
    }

    /// Handle the setup signal of a unit. Returns true the first time a given
    /// unit signals.
    pub fn on_setup(&mut self, worker: usize) -> bool {
        match self.workers.get_mut(worker) {
            Some(handle) => handle.setup(self.local_queue_size),
            None => {
                tracing::warn!(worker, "setup signal from an unknown worker");
                false
            }
        }
    }

    /// Handle a completion event from a unit.
    ///
    /// Completions that don't match a job currently running on that worker
    /// (duplicates, stale or misrouted events) are ignored.
    pub fn on_done(&mut self, worker: usize, done: Done<Output>) {
        profiling::scope!("on_done");

        let admission = match self.pending.get(&done.id).and_then(|p| p.admitted) {
            Some(admission) if admission.worker == worker => admission,
            _ => {
                tracing::trace!(job = done.id.0, worker, "dropping unmatched completion");
                return;
            }
        };

        if let Some(pending) = self.pending.remove(&done.id) {
            pending.resolver.resolve(done.result);
        }
        self.completed += 1;

        let handle = &mut self.workers[worker];
        handle.complete(admission.estimate);

        self.samples.push((done.name, done.observed));
        self.update_estimates.signal();

        if handle.running() == 0 && !self.global_queue.is_empty() {
            self.reflow.signal();
        }
    }

    pub fn on_exit(&mut self, worker: usize) {
        if let Some(handle) = self.workers.get_mut(worker) {
            handle.mark_exited();
        }
    }

    /// Run the armed maintenance triggers. Returns true if anything ran.
    ///
    /// Called by the host when it has nothing else to do.
    pub fn run_idle_tasks(&mut self) -> bool {
        let update_estimates = Arc::clone(&self.update_estimates);
        let reflow = Arc::clone(&self.reflow);

        let mut ran = update_estimates.run(|| self.fold_samples());
        ran |= reflow.run(|| self.reflow_pass());

        ran
    }

    fn fold_samples(&mut self) {
        for (name, observed) in self.samples.drain(..) {
            self.estimates.record_sample(&name, observed);
        }
    }

    /// Move jobs from the head of the global queue to workers until the
    /// queue is empty or the head job can't be admitted.
    fn reflow_pass(&mut self) {
        let mut admitted = 0;
        while let Some(call) = self.global_queue.pop_front() {
            if let Err(call) = self.try_admit(call, Priority::Low) {
                self.global_queue.push_front(call);
                break;
            }
            admitted += 1;
        }

        tracing::debug!(admitted, remaining = self.global_queue.len(), "reflow");
    }

    pub fn time_snapshot(&self) -> TimeSnapshot {
        self.estimates.snapshot()
    }

    pub fn stats(&self) -> StationStats {
        StationStats {
            workers: self.workers.iter().map(WorkerHandle::status).collect(),
            queued: self.global_queue.len(),
            pending: self.pending.len(),
            completed: self.completed,
            reflows: self.reflow.runs(),
        }
    }

    /// Ask every unit to shut down and drop the jobs nobody will run.
    ///
    /// Returns the number of dropped jobs.
    pub fn begin_shut_down(&mut self) -> usize {
        for worker in &mut self.workers {
            worker.shut_down();
        }

        let dropped = self.global_queue.len();
        for call in self.global_queue.drain(..) {
            // Dropping the resolver leaves the handle unresolved.
            self.pending.remove(&call.id);
        }

        if dropped > 0 {
            tracing::warn!(dropped, "shutting down with queued jobs, they will never run");
        }

        dropped
    }

    #[cfg(test)]
    fn queued_ids(&self) -> Vec<JobId> {
        self.global_queue.iter().map(|call| call.id).collect()
    }

    #[cfg(test)]
    fn worker(&self, idx: usize) -> WorkerStatus {
        self.workers[idx].status()
    }
}

#[cfg(test)]
use crossbeam_channel::Receiver;

#[cfg(test)]
fn fake_pool(
    num_workers: usize,
    local_queue_size: u32,
    estimates: EstimateTable,
) -> (Dispatcher<u32, u32>, Vec<Receiver<Outbound<u32>>>) {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_workers)
        .map(|_| crossbeam_channel::unbounded())
        .unzip();

    let mut dispatcher = Dispatcher::new(senders, local_queue_size, estimates);
    for (idx, rx) in receivers.iter().enumerate() {
        assert!(dispatcher.on_setup(idx));
        assert!(matches!(rx.try_recv(), Ok(Outbound::SetupAck { .. })));
    }

    (dispatcher, receivers)
}

// Pops the next call a fake unit received, along with its priority.
#[cfg(test)]
fn next_call(rx: &Receiver<Outbound<u32>>) -> Option<(Call<u32>, Priority)> {
    match rx.try_recv() {
        Ok(Outbound::Call(call)) => Some((call, Priority::Low)),
        Ok(Outbound::CallPriority(call)) => Some((call, Priority::High)),
        Ok(other) => panic!("unexpected message {:?}", other),
        Err(_) => None,
    }
}

#[cfg(test)]
fn done(call: &Call<u32>, observed: f64) -> Done<u32> {
    Done {
        id: call.id,
        name: call.name.clone(),
        result: call.data * 10,
        observed,
    }
}

#[cfg(test)]
fn simple(d: &mut Dispatcher<u32, u32>, name: &str, data: u32, priority: Priority) -> JobHandle<u32> {
    d.submit(name.to_string(), data, CallKind::Simple, priority)
}

#[test]
fn overflow_and_reflow() {
    let (mut d, units) = fake_pool(2, 1, EstimateTable::new(10.0));

    let h0 = simple(&mut d, "add", 0, Priority::Low);
    let h1 = simple(&mut d, "add", 1, Priority::Low);
    let h2 = simple(&mut d, "add", 2, Priority::Low);

    let (job0, _) = next_call(&units[0]).unwrap();
    let (job1, _) = next_call(&units[1]).unwrap();
    assert_eq!(job0.id, h0.id());
    assert_eq!(job1.id, h1.id());
    assert_eq!(d.worker(0).running, 1);
    assert_eq!(d.worker(1).running, 1);
    assert_eq!(d.queued_ids(), vec![h2.id()]);

    d.on_done(0, done(&job0, 3.0));
    assert_eq!(h0.resolve_assuming_ready(), 0);
    assert_eq!(d.worker(0).running, 0);
    // Nothing moves until the host runs the idle tasks.
    assert!(next_call(&units[0]).is_none());

    assert!(d.run_idle_tasks());
    let (job2, priority) = next_call(&units[0]).unwrap();
    assert_eq!(job2.id, h2.id());
    assert_eq!(priority, Priority::Low);
    assert_eq!(d.worker(0).running, 1);
    assert!(d.queued_ids().is_empty());
    assert_eq!(d.stats().reflows, 1);

    d.on_done(1, done(&job1, 3.0));
    d.on_done(0, done(&job2, 3.0));
    assert_eq!(h1.resolve_assuming_ready(), 10);
    assert_eq!(h2.resolve_assuming_ready(), 20);

    let stats = d.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.completed, 3);
}

#[test]
fn ties_go_to_the_lowest_index() {
    let (mut d, units) = fake_pool(3, 8, EstimateTable::new(10.0));

    for i in 0..4 {
        simple(&mut d, "add", i, Priority::Low);
    }

    assert_eq!(next_call(&units[0]).unwrap().0.data, 0);
    assert_eq!(next_call(&units[1]).unwrap().0.data, 1);
    assert_eq!(next_call(&units[2]).unwrap().0.data, 2);
    assert_eq!(next_call(&units[0]).unwrap().0.data, 3);
    assert_eq!(d.worker(0).backlog, 20.0);
}

#[test]
fn smallest_backlog_wins() {
    let snapshot: TimeSnapshot = [("big", 100.0), ("small", 1.0)].into_iter().collect();
    let (mut d, units) = fake_pool(2, 4, EstimateTable::with_snapshot(&snapshot, 10.0));

    simple(&mut d, "big", 0, Priority::Low);
    for i in 1..5 {
        simple(&mut d, "small", i, Priority::Low);
    }

    // Worker 1 takes every small job until it is full.
    assert_eq!(next_call(&units[0]).unwrap().0.name, "big");
    assert!(next_call(&units[0]).is_none());
    for _ in 0..4 {
        assert_eq!(next_call(&units[1]).unwrap().0.name, "small");
    }
    assert_eq!(d.worker(1).running, 4);
    assert_eq!(d.worker(1).backlog, 4.0);

    // Full workers are skipped no matter how small their backlog is.
    simple(&mut d, "small", 5, Priority::Low);
    assert_eq!(next_call(&units[0]).unwrap().0.data, 5);
    assert_eq!(d.worker(0).backlog, 101.0);
}

#[test]
fn priority_bypasses_the_local_queue_limit() {
    let (mut d, units) = fake_pool(1, 1, EstimateTable::new(10.0));

    simple(&mut d, "add", 0, Priority::Low);
    let queued = simple(&mut d, "add", 1, Priority::Low);
    let urgent = simple(&mut d, "add", 2, Priority::High);

    assert_eq!(next_call(&units[0]).unwrap().1, Priority::Low);
    let (call, priority) = next_call(&units[0]).unwrap();
    assert_eq!(call.id, urgent.id());
    assert_eq!(priority, Priority::High);
    assert_eq!(d.worker(0).running, 2);
    assert_eq!(d.queued_ids(), vec![queued.id()]);
}

#[test]
fn priority_picks_the_smallest_backlog() {
    let snapshot: TimeSnapshot = [("big", 100.0), ("small", 1.0)].into_iter().collect();
    let (mut d, units) = fake_pool(2, 1, EstimateTable::with_snapshot(&snapshot, 10.0));

    simple(&mut d, "big", 0, Priority::Low);
    simple(&mut d, "small", 1, Priority::Low);
    next_call(&units[0]).unwrap();
    next_call(&units[1]).unwrap();

    simple(&mut d, "big", 2, Priority::High);
    let (call, priority) = next_call(&units[1]).unwrap();
    assert_eq!((call.data, priority), (2, Priority::High));
    assert_eq!(d.worker(1).running, 2);
}

#[test]
fn seeded_estimate_used_for_admission() {
    let snapshot: TimeSnapshot = [("add", 2.0)].into_iter().collect();
    let (mut d, _units) = fake_pool(1, 8, EstimateTable::with_snapshot(&snapshot, 10.0));

    simple(&mut d, "add", 0, Priority::Low);
    assert_eq!(d.worker(0).backlog, 2.0);

    simple(&mut d, "unknown", 0, Priority::Low);
    assert_eq!(d.worker(0).backlog, 12.0);
}

#[test]
fn duplicate_and_stale_completions() {
    let (mut d, units) = fake_pool(2, 8, EstimateTable::new(10.0));

    let handle = simple(&mut d, "add", 4, Priority::Low);
    simple(&mut d, "add", 5, Priority::Low);
    let (job, _) = next_call(&units[0]).unwrap();
    let (other, _) = next_call(&units[1]).unwrap();

    // Reported by the wrong worker.
    d.on_done(1, done(&job, 1.0));
    assert!(!handle.poll());
    assert_eq!(d.worker(1).running, 1);

    d.on_done(0, done(&job, 1.0));
    assert!(handle.poll());
    assert_eq!(d.worker(0).running, 0);

    d.on_done(0, done(&job, 1.0));
    assert_eq!(d.worker(0).running, 0);
    assert_eq!(d.stats().completed, 1);

    let unknown = Call { id: JobId(999), name: "add".to_string(), data: 0, kind: CallKind::Simple };
    d.on_done(1, done(&unknown, 1.0));
    assert_eq!(d.worker(1).running, 1);

    d.on_done(1, done(&other, 1.0));
    assert_eq!(d.stats().pending, 0);
    assert_eq!(handle.resolve_assuming_ready(), 40);
}

#[test]
fn estimates_update_when_idle() {
    let (mut d, units) = fake_pool(1, 8, EstimateTable::new(10.0));

    let calls: Vec<_> = (0..3).map(|i| {
        simple(&mut d, "add", i, Priority::Low);
        next_call(&units[0]).unwrap().0
    }).collect();
    assert_eq!(d.worker(0).backlog, 30.0);

    d.on_done(0, done(&calls[0], 4.0));
    assert!(d.time_snapshot().get("add").is_none());
    assert_eq!(d.worker(0).backlog, 20.0);

    d.on_done(0, done(&calls[1], 6.0));
    d.on_done(0, done(&calls[2], 5.0));
    assert!(d.run_idle_tasks());
    assert!(!d.run_idle_tasks());

    assert_eq!(d.time_snapshot().get("add"), Some(5.0));
    // The queue was empty, so there was no reason to reflow.
    assert_eq!(d.stats().reflows, 0);
}

#[test]
fn backlog_uses_the_admission_time_estimate() {
    let (mut d, units) = fake_pool(1, 8, EstimateTable::new(10.0));

    simple(&mut d, "add", 0, Priority::Low);
    let (first, _) = next_call(&units[0]).unwrap();
    simple(&mut d, "add", 1, Priority::Low);
    let (second, _) = next_call(&units[0]).unwrap();

    d.on_done(0, done(&first, 1.0));
    d.run_idle_tasks();
    assert_eq!(d.time_snapshot().get("add"), Some(1.0));

    // Admitted with the fallback, so the fallback is subtracted.
    simple(&mut d, "add", 2, Priority::Low);
    assert_eq!(d.worker(0).backlog, 11.0);
    d.on_done(0, done(&second, 1.0));
    assert_eq!(d.worker(0).backlog, 1.0);
}

#[test]
fn reflow_stops_at_the_head() {
    let (mut d, units) = fake_pool(1, 2, EstimateTable::new(10.0));

    let handles: Vec<_> = (0..5).map(|i| simple(&mut d, "add", i, Priority::Low)).collect();
    let job0 = next_call(&units[0]).unwrap().0;
    let job1 = next_call(&units[0]).unwrap().0;
    assert_eq!(d.queued_ids(), vec![handles[2].id(), handles[3].id(), handles[4].id()]);

    // The worker isn't idle yet.
    d.on_done(0, done(&job0, 1.0));
    d.run_idle_tasks();
    assert_eq!(d.stats().reflows, 0);
    assert_eq!(d.queued_ids().len(), 3);

    d.on_done(0, done(&job1, 1.0));
    d.run_idle_tasks();
    assert_eq!(d.stats().reflows, 1);
    assert_eq!(next_call(&units[0]).unwrap().0.id, handles[2].id());
    assert_eq!(next_call(&units[0]).unwrap().0.id, handles[3].id());
    assert!(next_call(&units[0]).is_none());
    assert_eq!(d.queued_ids(), vec![handles[4].id()]);
}

#[test]
fn shut_down_drops_queued_jobs() {
    let (mut d, units) = fake_pool(1, 1, EstimateTable::new(10.0));

    simple(&mut d, "add", 0, Priority::Low);
    let queued = simple(&mut d, "add", 1, Priority::Low);
    let (running, _) = next_call(&units[0]).unwrap();

    assert_eq!(d.begin_shut_down(), 1);
    assert!(matches!(units[0].try_recv(), Ok(Outbound::Shutdown)));
    assert_eq!(d.stats().pending, 1);

    // The running job still completes normally.
    d.on_done(0, done(&running, 1.0));
    assert_eq!(d.stats().pending, 0);
    assert!(!queued.poll());
}

#[test]
fn job_ids_are_unique() {
    let (mut d, _units) = fake_pool(2, 1, EstimateTable::new(10.0));

    let mut ids: Vec<_> = (0..10)
        .map(|i| simple(&mut d, "add", i, if i % 3 == 0 { Priority::High } else { Priority::Low }).id())
        .collect();
    let len = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), len);
}
