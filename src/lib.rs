//! A predictive job scheduler for a small pool of isolated workers.
//!
//! Jobs are named, registered up front, and run on execution units that share
//! no mutable state with the scheduler or with each other: payloads move to a
//! unit by value and results move back by value.
//!
//! How it works:
//! - Every job type has a duration estimate, the running mean of the durations
//!   observed so far (optionally seeded from a previous run's snapshot).
//! - Each worker tracks how many jobs it is running and the sum of their
//!   estimates. New jobs go to the worker with the smallest estimated backlog
//!   among those with room in their local queue.
//! - When every local queue is full, jobs wait in a global FIFO queue and are
//!   moved to workers as they become idle.
//! - Priority jobs ignore local queue limits and run ahead of normal jobs on
//!   the worker they are sent to.
//!
//! There is no work-stealing, cancellation or timeout: once a job is admitted it
//! runs to completion.
//!
//! ```no_run
//! use station::{Registry, Station, Priority};
//!
//! let mut registry = Registry::new();
//! registry.register("square", |x: u64| x * x).unwrap();
//! registry.register_workgroup("sum", |x: &u64, i| x + i as u64, |a, b| a + b).unwrap();
//!
//! let station = Station::builder()
//!     .with_workers(3)
//!     .build(registry)
//!     .unwrap();
//!
//! let a = station.call("square", 12).unwrap();
//! let b = station.call_workgroup("sum", 0, 100).unwrap();
//! let c = station.job("square").with_priority(Priority::High).run(3).unwrap();
//!
//! assert_eq!(a.resolve(), 144);
//! assert_eq!(b.resolve(), 4950);
//! assert_eq!(c.resolve(), 9);
//!
//! let snapshot = station.time_snapshot();
//! station.shut_down().wait();
//! ```

// TODO: report handler panics to the station. A panicking handler currently
// takes its execution unit down and leaves the unit's jobs unresolved.

mod core;
mod error;
pub mod coalesce;
pub mod estimate;
pub mod handle;
pub mod registry;

pub use error::{Result, StationError};
pub use estimate::{EstimateTable, TimeSnapshot};
pub use handle::JobHandle;
pub use registry::{Handler, JobKind, Registry};
pub use crate::core::job::{JobId, Priority};
pub use crate::core::station::{Station, StationBuilder, CallBuilder};
pub use crate::core::station::{
    DEFAULT_FALLBACK_DURATION, DEFAULT_LOCAL_QUEUE_SIZE, DEFAULT_WORKERS, DEFAULT_WORKGROUP_SLICE,
};
pub use crate::core::dispatcher::StationStats;
pub use crate::core::worker::{WorkerState, WorkerStatus};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::WorkerHook;
pub use crate::core::sync;
