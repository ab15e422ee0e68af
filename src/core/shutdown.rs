/// Shutdown
///
/// Shutting down is a short handshake. The station raises a flag (under the
/// dispatcher lock, so no call can sneak into the global queue afterwards) and
/// posts a message to the control thread. The control thread drops whatever is
/// still in the global queue and tells every execution unit to stop. Units
/// finish the jobs they were already given, report the results and exit; the
/// control thread exits after the last unit. The handle joins all of them.

use crate::sync::{Ordering, AtomicBool, Mutex, Arc, thread::JoinHandle};

use crate::core::Shared;
use crate::core::job::Inbound;

pub(crate) struct Shutdown {
    is_shutting_down: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn set_threads(&self, threads: Vec<JoinHandle<()>>) {
        *self.threads.lock().unwrap() = threads;
    }

    pub fn begin_shut_down<Input, Output>(shared: &Arc<Shared<Input, Output>>) -> ShutdownHandle {
        {
            let _dispatcher = shared.lock();
            if shared.shutdown.is_shutting_down.swap(true, Ordering::SeqCst) {
                // Someone else already started, and owns the threads.
                return ShutdownHandle { threads: Vec::new() };
            }
        }

        tracing::info!("station shutting down");

        // The control thread only exits after this message or after the
        // last unit, so it is still listening.
        let _ = shared.control.send(Inbound::Shutdown);

        let threads = std::mem::take(&mut *shared.shutdown.threads.lock().unwrap());

        ShutdownHandle { threads }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }
}

pub struct ShutdownHandle {
    threads: Vec<JoinHandle<()>>,
}

impl ShutdownHandle {
    /// Block until every thread of the station has exited.
    pub fn wait(self) {
        for thread in self.threads {
            if thread.join().is_err() {
                tracing::warn!("a station thread panicked");
            }
        }
    }
}

#[test]
fn test_shutdown() {
    use std::sync::atomic::AtomicU32;
    use crate::{Registry, Station};
    static INITIALIZED_WORKERS: AtomicU32 = AtomicU32::new(0);
    static SHUTDOWN_WORKERS: AtomicU32 = AtomicU32::new(0);

    for _ in 0..20 {
        for num_workers in 1..4 {
            INITIALIZED_WORKERS.store(0, Ordering::SeqCst);
            SHUTDOWN_WORKERS.store(0, Ordering::SeqCst);

            let mut registry = Registry::new();
            registry.register("noop", |x: u32| x).unwrap();

            let station = Station::builder()
                .with_workers(num_workers)
                .with_start_handler(|_id| { INITIALIZED_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(|_id| { SHUTDOWN_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .build(registry)
                .unwrap();

            let expected = station.num_workers();
            station.wait_ready();

            let handle = station.shut_down();
            // A second request is harmless.
            station.shut_down().wait();
            handle.wait();

            assert_eq!(INITIALIZED_WORKERS.load(Ordering::SeqCst), expected);
            assert_eq!(SHUTDOWN_WORKERS.load(Ordering::SeqCst), expected);
            assert!(matches!(station.call("noop", 1), Err(crate::StationError::ShutDown)));
        }
    }
}

#[test]
fn shutdown_after_handler_panic() {
    use std::time::Duration;
    use crate::{Registry, Station};

    let mut registry = Registry::new();
    registry.register("boom", |_: u32| -> u32 { panic!("handler failure") }).unwrap();
    registry.register("noop", |x: u32| x).unwrap();

    let station = Station::builder()
        .with_workers(2)
        .build(registry)
        .unwrap();

    // The handle of a job whose handler panicked never resolves.
    let _lost = station.call("boom", 0).unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = station.shut_down();
    std::thread::spawn(move || {
        handle.wait();
        let _ = tx.send(());
    });

    assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
}
