//! Handles are references to jobs submitted to the station.
//!
//! A handle and its resolver share a heap-allocated completion slot:
//!  - The resolver is held by the dispatcher in its pending-job map and is
//!    consumed when the matching completion arrives, so a job resolves at
//!    most once.
//!  - The handle is held by the caller and can poll, wait for, or take the
//!    result.
//!
//! Waiting first spins briefly (most jobs are short), then falls back to a
//! condition variable.

use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::core::job::JobId;
use crate::sync::{Arc, AtomicBool, Condvar, Mutex, Ordering};

struct Completion<Output> {
    done: AtomicBool,
    slot: Mutex<Option<Output>>,
    cond: Condvar,
}

/// Creates a connected resolver/handle pair for a job.
pub(crate) fn job_handle<Output>(id: JobId) -> (Resolver<Output>, JobHandle<Output>) {
    let completion = Arc::new(Completion {
        done: AtomicBool::new(false),
        slot: Mutex::new(None),
        cond: Condvar::new(),
    });

    (
        Resolver { completion: completion.clone() },
        JobHandle { id, completion },
    )
}

/// The write side of a job handle.
pub(crate) struct Resolver<Output> {
    completion: Arc<Completion<Output>>,
}

impl<Output> Resolver<Output> {
    pub fn resolve(self, output: Output) {
        let mut slot = self.completion.slot.lock().unwrap();
        debug_assert!(slot.is_none());
        *slot = Some(output);
        self.completion.done.store(true, Ordering::Release);
        self.completion.cond.notify_all();
    }
}

/// A non-clonable handle which owns the result of a job.
pub struct JobHandle<Output> {
    id: JobId,
    completion: Arc<Completion<Output>>,
}

impl<Output> JobHandle<Output> {
    pub fn id(&self) -> JobId { self.id }

    /// Returns true once the result is available.
    pub fn poll(&self) -> bool {
        self.completion.done.load(Ordering::Acquire)
    }

    /// Block until the result is available.
    ///
    /// There is no timeout: if the job never completes this never returns.
    pub fn wait(&self) {
        profiling::scope!("JobHandle::wait");

        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.poll() {
                return;
            }
            backoff.snooze();
        }

        let mut slot = self.completion.slot.lock().unwrap();
        while slot.is_none() {
            slot = self.completion.cond.wait(slot).unwrap();
        }
    }

    /// Block until the result is available and take it.
    pub fn resolve(self) -> Output {
        self.wait();
        self.take()
    }

    /// Like `resolve`, but gives up after `timeout` and hands the handle back.
    ///
    /// The job itself is not affected: it keeps running and can still be
    /// resolved later.
    pub fn resolve_timeout(self, timeout: Duration) -> Result<Output, Self> {
        let deadline = Instant::now() + timeout;
        {
            let mut slot = self.completion.slot.lock().unwrap();
            while slot.is_none() {
                let now = Instant::now();
                if now >= deadline {
                    drop(slot);
                    return Err(self);
                }
                slot = self.completion.cond.wait_timeout(slot, deadline - now).unwrap().0;
            }
        }

        Ok(self.take())
    }

    /// Take the result, panicking if it isn't there yet.
    pub fn resolve_assuming_ready(self) -> Output {
        assert!(self.poll(), "Handle is not ready.");
        self.take()
    }

    fn take(self) -> Output {
        let mut slot = self.completion.slot.lock().unwrap();
        slot.take().expect("job handle resolved twice")
    }
}

impl<Output> std::fmt::Debug for JobHandle<Output> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("done", &self.poll())
            .finish()
    }
}

#[test]
fn resolve_on_another_thread() {
    use crate::sync::thread;

    let (resolver, handle) = job_handle::<u32>(JobId(7));
    assert_eq!(handle.id(), JobId(7));
    assert!(!handle.poll());

    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        resolver.resolve(42);
    });

    assert_eq!(handle.resolve(), 42);
    t.join().unwrap();
}

#[test]
fn resolve_timeout_hands_back() {
    let (resolver, handle) = job_handle::<&'static str>(JobId(0));

    let handle = match handle.resolve_timeout(Duration::from_millis(10)) {
        Ok(_) => panic!("nothing was resolved yet"),
        Err(handle) => handle,
    };

    resolver.resolve("done");
    assert!(handle.poll());
    assert_eq!(handle.resolve_timeout(Duration::from_millis(10)).unwrap(), "done");
}

#[test]
#[should_panic]
fn not_ready() {
    let (_resolver, handle) = job_handle::<u32>(JobId(1));
    handle.resolve_assuming_ready();
}
