//! Coalescing triggers.
//!
//! A trigger collapses any number of "please run this maintenance task"
//! signals into at most one pending execution. The host decides when to run
//! armed triggers; the station's control thread does it whenever it has no
//! inbound message left to process.

use crate::sync::{AtomicBool, AtomicU64, Ordering};

pub struct Coalesce {
    armed: AtomicBool,
    runs: AtomicU64,
    name: &'static str,
}

impl Coalesce {
    pub fn new(name: &'static str) -> Self {
        Coalesce {
            armed: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            name,
        }
    }

    /// Request a deferred run.
    ///
    /// Returns true if this call armed the trigger, false if a run was
    /// already pending.
    pub fn signal(&self) -> bool {
        let armed = self.armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();

        if armed {
            tracing::trace!(trigger = self.name, "armed");
        }

        armed
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Run `action` if the trigger is armed.
    ///
    /// The trigger is disarmed before `action` runs, so signals raised while
    /// it runs arm it again for the next opportunity.
    pub fn run<F: FnOnce()>(&self, action: F) -> bool {
        if self.armed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        profiling::scope!(self.name);
        action();
        self.runs.fetch_add(1, Ordering::Relaxed);

        true
    }

    /// Number of times the wrapped action ran.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str { self.name }
}

#[test]
fn coalesce_signals() {
    let trigger = Coalesce::new("test");
    assert!(!trigger.is_armed());

    assert!(trigger.signal());
    assert!(!trigger.signal());
    assert!(!trigger.signal());
    assert!(trigger.is_armed());

    let mut count = 0;
    assert!(trigger.run(|| count += 1));
    assert!(!trigger.run(|| count += 1));
    assert_eq!(count, 1);
    assert_eq!(trigger.runs(), 1);
    assert!(!trigger.is_armed());
}

#[test]
fn rearm_during_run() {
    let trigger = Coalesce::new("test");
    trigger.signal();

    let mut count = 0;
    trigger.run(|| {
        count += 1;
        assert!(trigger.signal());
    });
    assert!(trigger.is_armed());

    trigger.run(|| count += 1);
    assert_eq!(count, 2);
    assert!(!trigger.is_armed());
}

#[test]
fn concurrent_signals() {
    use crate::sync::{Arc, thread};

    let trigger = Arc::new(Coalesce::new("test"));
    let armed = Arc::new(AtomicU64::new(0));

    let threads: Vec<_> = (0..4).map(|_| {
        let trigger = trigger.clone();
        let armed = armed.clone();
        thread::spawn(move || {
            for _ in 0..1000 {
                if trigger.signal() {
                    armed.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    }).collect();

    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(armed.load(Ordering::Relaxed), 1);
    assert!(trigger.run(|| {}));
}
