use std::time::Duration;

use crossbeam_utils::Backoff;

use super::sync::{AtomicBool, Condvar, Mutex, Ordering};

/// The readiness gate.
///
/// A gate waits until a given number of dependencies are met (one per
/// execution unit that has to complete its handshake). Once open it never
/// closes again.
///
/// The completion of dependencies is communicated to the gate by calling
/// `Gate::signal`. There is no timeout: a dependency that never signals
/// keeps the gate closed forever.
pub struct Gate {
    // The number of unresolved dependencies.
    deps: Mutex<u32>,
    // Mirrors `deps == 0` so that the open gate can be checked without locking.
    open: AtomicBool,
    cond: Condvar,
}

impl Gate {
    pub fn new(deps: u32) -> Self {
        Gate {
            deps: Mutex::new(deps),
            open: AtomicBool::new(deps == 0),
            cond: Condvar::new(),
        }
    }

    /// Resolve one dependency.
    ///
    /// Returns true if this call opened the gate.
    pub fn signal(&self) -> bool {
        let mut deps = self.deps.lock().unwrap();
        if *deps == 0 {
            return false;
        }

        *deps -= 1;
        if *deps > 0 {
            return false;
        }

        self.open.store(true, Ordering::Release);
        self.cond.notify_all();

        true
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u32 {
        *self.deps.lock().unwrap()
    }

    /// Block until every dependency is met.
    pub fn wait(&self) {
        if self.is_open() {
            // Fast path, the common case once the station is running.
            return;
        }

        profiling::scope!("wait(gate)");

        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.is_open() {
                return;
            }
            backoff.snooze();
        }

        let mut deps = self.deps.lock().unwrap();
        while *deps > 0 {
            deps = self.cond.wait(deps).unwrap();
        }
    }

    /// Like `wait`, but gives up after `timeout`. Returns whether the gate is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_open() {
            return true;
        }

        let deps = self.deps.lock().unwrap();
        let (deps, _) = self.cond.wait_timeout_while(deps, timeout, |deps| *deps > 0).unwrap();

        *deps == 0
    }
}

#[test]
fn gate_opens_after_all_signals() {
    let gate = Gate::new(3);
    assert!(!gate.is_open());

    assert!(!gate.signal());
    assert!(!gate.signal());
    assert!(!gate.is_open());
    assert_eq!(gate.remaining(), 1);
    assert!(!gate.wait_timeout(Duration::from_millis(5)));

    assert!(gate.signal());
    assert!(gate.is_open());
    assert!(gate.wait_timeout(Duration::from_millis(5)));
    gate.wait();

    // Never closes again.
    assert!(!gate.signal());
    assert!(gate.is_open());
}

#[test]
fn gate_wakes_waiters() {
    use super::sync::{Arc, thread};

    let gate = Arc::new(Gate::new(2));

    let waiters: Vec<_> = (0..3).map(|_| {
        let gate = gate.clone();
        thread::spawn(move || {
            gate.wait();
            assert!(gate.is_open());
        })
    }).collect();

    thread::sleep(Duration::from_millis(10));
    gate.signal();
    thread::sleep(Duration::from_millis(10));
    assert!(!gate.is_open());
    gate.signal();

    for waiter in waiters {
        waiter.join().unwrap();
    }
}
