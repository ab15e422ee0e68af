pub use std::sync::atomic::Ordering;

#[cfg(not(loom))] pub use std::{
    sync::{
        Arc, Mutex, MutexGuard, Condvar,
        atomic::{AtomicBool, AtomicU64},
    },
    thread,
};


#[cfg(loom)] pub use loom::{
    sync::{
        Arc, Mutex, MutexGuard, Condvar,
        atomic::{AtomicBool, AtomicU64},
    },
    thread
};
