pub mod job;
pub mod gate;
pub mod station;
pub mod shutdown;
pub mod worker;
pub mod dispatcher;
mod unit;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use sync::{Arc, Mutex, MutexGuard, thread};
use crate::error::{Result, StationError};
use crate::estimate::EstimateTable;
use crate::handle::JobHandle;
use crate::registry::{JobKind, Registry};
use job::{CallKind, Inbound, Priority};
use gate::Gate;
use dispatcher::Dispatcher;
use station::{Station, StationBuilder};
use shutdown::Shutdown;
use unit::Unit;

/// Data accessible from the calling threads and the control thread.
pub(crate) struct Shared<Input, Output> {
    /// All of the scheduling state, behind one lock.
    pub dispatcher: Mutex<Dispatcher<Input, Output>>,
    /// Opens once every execution unit has completed its handshake.
    pub gate: Gate,
    pub registry: Arc<Registry<Input, Output>>,
    pub num_workers: u32,
    pub local_queue_size: u32,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    /// Lets the station post to the control thread.
    pub control: Sender<Inbound<Output>>,
}

impl<Input, Output> Shared<Input, Output> {
    pub fn lock(&self) -> MutexGuard<'_, Dispatcher<Input, Output>> {
        self.dispatcher.lock().unwrap()
    }

    pub fn submit(&self, name: &str, data: Input, kind: CallKind, priority: Priority) -> Result<JobHandle<Output>> {
        let expected = match kind {
            CallKind::Simple => JobKind::Simple,
            CallKind::Workgroup { len: 0 } => return Err(StationError::EmptyWorkgroup(name.to_string())),
            CallKind::Workgroup { .. } => JobKind::Workgroup,
        };
        self.registry.check(name, expected)?;

        self.gate.wait();

        let mut dispatcher = self.lock();
        // Checked under the lock so that nothing gets queued after the
        // control thread has drained the global queue.
        if self.shutdown.is_shutting_down() {
            return Err(StationError::ShutDown);
        }

        Ok(dispatcher.submit(name.to_string(), data, kind, priority))
    }
}

pub(crate) fn init<Input, Output>(params: StationBuilder, registry: Registry<Input, Output>) -> Result<Station<Input, Output>>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    let num_workers = params.num_workers as usize;

    let estimates = match &params.time_snapshot {
        Some(snapshot) => EstimateTable::with_snapshot(snapshot, params.fallback_duration),
        None => EstimateTable::new(params.fallback_duration),
    };

    let (control_tx, control_rx) = crossbeam_channel::unbounded();

    let mut senders = Vec::with_capacity(num_workers);
    let mut inboxes = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let (tx, rx) = crossbeam_channel::unbounded();
        senders.push(tx);
        inboxes.push(rx);
    }

    let registry = Arc::new(registry);
    let hooks = Arc::new(UnitHooks {
        start: params.start_handler,
        exit: params.exit_handler,
    });

    let shared = Arc::new(Shared {
        dispatcher: Mutex::new(Dispatcher::new(senders, params.local_queue_size, estimates)),
        gate: Gate::new(num_workers as u32),
        registry: registry.clone(),
        num_workers: num_workers as u32,
        local_queue_size: params.local_queue_size,
        shutdown: Shutdown::new(),
        control: control_tx.clone(),
    });

    let mut threads = Vec::with_capacity(num_workers + 1);

    for (i, inbox) in inboxes.into_iter().enumerate() {
        let unit = Unit::new(
            i,
            inbox,
            control_tx.clone(),
            registry.clone(),
            hooks.clone(),
            params.workgroup_slice,
        );

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i as u32));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        threads.push(builder.spawn(move || {
            profiling::register_thread!("Station unit");

            unit.run();
        })?);
    }

    let control = Control {
        shared: shared.clone(),
        inbox: control_rx,
        live_units: num_workers,
        shutting_down: false,
    };

    threads.push(thread::Builder::new()
        .name("Station control".to_string())
        .spawn(move || {
            profiling::register_thread!("Station control");

            control.run();
        })?);

    shared.shutdown.set_threads(threads);

    tracing::debug!(
        workers = num_workers,
        local_queue_size = params.local_queue_size,
        fallback = params.fallback_duration,
        "station started",
    );

    Ok(Station { shared })
}

/// The control thread processes inbound events one at a time, and runs the
/// dispatcher's maintenance tasks whenever it runs out of events.
struct Control<Input, Output> {
    shared: Arc<Shared<Input, Output>>,
    inbox: Receiver<Inbound<Output>>,
    live_units: usize,
    shutting_down: bool,
}

impl<Input, Output> Control<Input, Output> {
    fn run(mut self) {
        loop {
            let msg = match self.inbox.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty) => {
                    // Idle: good time for batched bookkeeping.
                    self.shared.lock().run_idle_tasks();

                    match self.inbox.recv() {
                        Ok(msg) => msg,
                        Err(_) => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            if !self.handle(msg) {
                break;
            }
        }

        tracing::debug!("control thread exiting");
    }

    // Returns false when the control thread should exit.
    fn handle(&mut self, msg: Inbound<Output>) -> bool {
        match msg {
            Inbound::Setup { worker } => {
                let first = self.shared.lock().on_setup(worker);
                if first && self.shared.gate.signal() {
                    tracing::info!(workers = self.shared.num_workers, "station ready");
                }
            }
            Inbound::Done { worker, done } => {
                self.shared.lock().on_done(worker, done);
            }
            Inbound::Exited { worker } => {
                self.shared.lock().on_exit(worker);
                self.live_units -= 1;
                if self.live_units == 0 {
                    if !self.shutting_down {
                        tracing::warn!("all execution units exited");
                    }
                    return false;
                }
            }
            Inbound::Shutdown => {
                if !self.shutting_down {
                    self.shutting_down = true;
                    self.shared.lock().begin_shut_down();
                }
            }
        }

        true
    }
}

pub(crate) struct UnitHooks {
    pub start: Option<Box<dyn WorkerHook>>,
    pub exit: Option<Box<dyn WorkerHook>>,
}

/// A callback run on an execution unit's thread when it starts or exits.
pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
