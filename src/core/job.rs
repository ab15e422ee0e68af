//! Jobs and the messages exchanged between the station and its execution units.
//!
//! Everything in here crosses a thread boundary by value: the payload moves to
//! the unit inside a `Call` and the result moves back inside a `Done`. Nothing
//! is shared.

/// Identifies a job within a station. Allocated in increasing order and never
/// reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub(crate) u64);

impl JobId {
    pub fn as_u64(&self) -> u64 { self.0 }
}

/// The priority of a job.
///
/// High priority jobs skip local-queue admission limits and are placed ahead
/// of normally queued work on the worker that receives them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

impl Priority {
    // For convenience, some per-priority data (like queues) are internally
    // stored in arrays.
    pub(crate) fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Low => 1,
        }
    }
}

impl Default for Priority {
    fn default() -> Self { Priority::Low }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    Simple,
    /// Split into `len` items, handled entirely by the execution unit.
    Workgroup { len: u32 },
}

/// A job on its way to an execution unit.
#[derive(Debug)]
pub struct Call<Input> {
    pub id: JobId,
    pub name: String,
    pub data: Input,
    pub kind: CallKind,
}

/// A completed job, on its way back from an execution unit.
#[derive(Debug)]
pub struct Done<Output> {
    pub id: JobId,
    pub name: String,
    pub result: Output,
    /// Wall-clock duration of the handler, in milliseconds.
    pub observed: f64,
}

/// Messages from the station to an execution unit.
#[derive(Debug)]
pub enum Outbound<Input> {
    /// Reply to `Inbound::Setup`: how many jobs the station will admit to the
    /// unit before overflowing to the global queue.
    SetupAck { local_queue_size: u32 },
    /// Normal admission, at the back of the unit's local queue.
    Call(Call<Input>),
    /// Priority admission, ahead of normally queued work.
    CallPriority(Call<Input>),
    /// Finish local work and exit.
    Shutdown,
}

impl<Input> Outbound<Input> {
    pub fn call(call: Call<Input>, priority: Priority) -> Self {
        match priority {
            Priority::High => Outbound::CallPriority(call),
            Priority::Low => Outbound::Call(call),
        }
    }
}

/// Messages from execution units (and the station itself) to the control thread.
#[derive(Debug)]
pub enum Inbound<Output> {
    /// The unit at this pool index has initialized.
    Setup { worker: usize },
    Done { worker: usize, done: Done<Output> },
    /// The unit at this pool index has shut down.
    Exited { worker: usize },
    /// Sent by `Station::shut_down` to the control thread.
    Shutdown,
}

#[test]
fn priority_routing() {
    let call = Call { id: JobId(3), name: "add".to_string(), data: (), kind: CallKind::Simple };
    assert!(matches!(Outbound::call(call, Priority::High), Outbound::CallPriority(c) if c.id == JobId(3)));

    let call = Call { id: JobId(4), name: "sum".to_string(), data: (), kind: CallKind::Workgroup { len: 8 } };
    match Outbound::call(call, Priority::Low) {
        Outbound::Call(c) => assert_eq!(c.kind, CallKind::Workgroup { len: 8 }),
        other => panic!("unexpected message {:?}", other),
    }

    assert_eq!(Priority::default(), Priority::Low);
    assert_ne!(Priority::High.index(), Priority::Low.index());
}
