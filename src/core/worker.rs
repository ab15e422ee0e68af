use crossbeam_channel::Sender;

use super::job::{Call, Outbound, Priority};

/// Lifecycle of an execution unit as seen by the station.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Spawned, handshake not completed yet.
    AwaitingSetup,
    /// No admitted job.
    Idle,
    /// At least one admitted job.
    Busy,
    Exited,
}

/// A snapshot of one worker's bookkeeping.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WorkerStatus {
    pub index: usize,
    pub state: WorkerState,
    /// Jobs sent to the worker minus completions received from it.
    pub running: u32,
    /// Sum of the admission-time estimates of the running jobs, in milliseconds.
    pub backlog: f64,
}

/// One execution unit and its live status.
///
/// The status is only ever updated by the dispatcher's handlers, never by the
/// unit itself, which cannot see it.
pub(crate) struct WorkerHandle<Input> {
    index: usize,
    sender: Sender<Outbound<Input>>,
    running: u32,
    backlog: f64,
    setup: bool,
    exited: bool,
}

impl<Input> WorkerHandle<Input> {
    pub fn new(index: usize, sender: Sender<Outbound<Input>>) -> Self {
        WorkerHandle {
            index,
            sender,
            running: 0,
            backlog: 0.0,
            setup: false,
            exited: false,
        }
    }

    #[inline]
    pub fn running(&self) -> u32 { self.running }

    #[inline]
    pub fn backlog(&self) -> f64 { self.backlog }

    pub fn state(&self) -> WorkerState {
        if self.exited {
            WorkerState::Exited
        } else if !self.setup {
            WorkerState::AwaitingSetup
        } else if self.running == 0 {
            WorkerState::Idle
        } else {
            WorkerState::Busy
        }
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            index: self.index,
            state: self.state(),
            running: self.running,
            backlog: self.backlog,
        }
    }

    /// Acknowledge the unit's setup signal.
    ///
    /// Returns false if the unit had already completed its handshake.
    pub fn setup(&mut self, local_queue_size: u32) -> bool {
        if self.setup {
            return false;
        }

        self.setup = true;
        self.post(Outbound::SetupAck { local_queue_size });

        true
    }

    /// Account for an admitted job and send it to the unit.
    pub fn admit(&mut self, call: Call<Input>, priority: Priority, estimate: f64) {
        self.running += 1;
        self.backlog += estimate;
        self.post(Outbound::call(call, priority));
    }

    /// Account for a completed job, using the estimate it was admitted with.
    pub fn complete(&mut self, estimate: f64) {
        debug_assert!(self.running > 0);
        self.running = self.running.saturating_sub(1);
        self.backlog -= estimate;

        if self.running == 0 {
            // Don't let rounding errors accumulate across busy periods.
            self.backlog = 0.0;
        }
    }

    pub fn shut_down(&mut self) {
        self.post(Outbound::Shutdown);
    }

    pub fn mark_exited(&mut self) {
        self.exited = true;
    }

    // Fire and forget.
    fn post(&self, msg: Outbound<Input>) {
        if self.sender.send(msg).is_err() {
            tracing::warn!(worker = self.index, "execution unit is gone, message dropped");
        }
    }
}

#[test]
fn worker_bookkeeping() {
    use super::job::{CallKind, JobId};

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut worker = WorkerHandle::new(0, tx);
    assert_eq!(worker.state(), WorkerState::AwaitingSetup);

    assert!(worker.setup(8));
    assert!(!worker.setup(8));
    assert!(matches!(rx.try_recv(), Ok(Outbound::SetupAck { local_queue_size: 8 })));
    assert!(rx.try_recv().is_err());
    assert_eq!(worker.state(), WorkerState::Idle);

    let call = Call { id: JobId(0), name: "a".to_string(), data: 1u32, kind: CallKind::Simple };
    worker.admit(call, Priority::Low, 2.5);
    let call = Call { id: JobId(1), name: "b".to_string(), data: 2u32, kind: CallKind::Simple };
    worker.admit(call, Priority::High, 0.1);

    assert_eq!(worker.state(), WorkerState::Busy);
    assert_eq!(worker.running(), 2);
    assert!((worker.backlog() - 2.6).abs() < 1e-9);
    assert!(matches!(rx.try_recv(), Ok(Outbound::Call(c)) if c.id == JobId(0)));
    assert!(matches!(rx.try_recv(), Ok(Outbound::CallPriority(c)) if c.id == JobId(1)));

    worker.complete(2.5);
    assert_eq!(worker.running(), 1);
    worker.complete(0.1);
    assert_eq!(worker.running(), 0);
    assert_eq!(worker.backlog(), 0.0);
    assert_eq!(worker.state(), WorkerState::Idle);

    worker.mark_exited();
    assert_eq!(worker.status().state, WorkerState::Exited);
}
