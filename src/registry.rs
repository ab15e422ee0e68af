//! The job-type registry.
//!
//! Every job type the station can run is registered up front under a name,
//! with a handler that is either a one-shot function or a workgroup (a job
//! split into indexed items that the execution unit processes in slices and
//! folds back into a single output).
//!
//! The registry is shared read-only by all execution units. Handlers are code,
//! not data: nothing mutable crosses the unit boundary through it.

use std::collections::HashMap;

use crate::error::{Result, StationError};

/// The kind of handler a job type was registered with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Simple,
    Workgroup,
}

pub type SimpleFn<I, O> = Box<dyn Fn(I) -> O + Send + Sync>;
pub type ItemFn<I, O> = Box<dyn Fn(&I, u32) -> O + Send + Sync>;
pub type ReduceFn<O> = Box<dyn Fn(O, O) -> O + Send + Sync>;

/// A tagged handler descriptor.
pub enum Handler<I, O> {
    /// Consumes the payload and produces the result in one go.
    Simple(SimpleFn<I, O>),
    /// Produces one output per item index in `0..len`, folded left to right
    /// with `reduce`.
    Workgroup {
        item: ItemFn<I, O>,
        reduce: ReduceFn<O>,
    },
}

impl<I, O> Handler<I, O> {
    pub fn kind(&self) -> JobKind {
        match self {
            Handler::Simple(..) => JobKind::Simple,
            Handler::Workgroup { .. } => JobKind::Workgroup,
        }
    }
}

/// Maps job-type names to their handlers.
pub struct Registry<I, O> {
    handlers: HashMap<String, Handler<I, O>>,
}

impl<I, O> Registry<I, O> {
    pub fn new() -> Self {
        Registry { handlers: HashMap::new() }
    }

    /// Register a one-shot job type.
    pub fn register<F>(&mut self, name: &str, handler: F) -> Result<()>
    where F: Fn(I) -> O + Send + Sync + 'static
    {
        self.insert(name, Handler::Simple(Box::new(handler)))
    }

    /// Register a workgroup job type.
    pub fn register_workgroup<F, R>(&mut self, name: &str, item: F, reduce: R) -> Result<()>
    where
        F: Fn(&I, u32) -> O + Send + Sync + 'static,
        R: Fn(O, O) -> O + Send + Sync + 'static,
    {
        self.insert(name, Handler::Workgroup {
            item: Box::new(item),
            reduce: Box::new(reduce),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Handler<I, O>> {
        self.handlers.get(name)
    }

    pub fn kind(&self, name: &str) -> Option<JobKind> {
        self.get(name).map(Handler::kind)
    }

    pub fn len(&self) -> usize { self.handlers.len() }

    pub fn is_empty(&self) -> bool { self.handlers.is_empty() }

    /// Check that `name` can be called with a call of the given kind.
    pub(crate) fn check(&self, name: &str, kind: JobKind) -> Result<()> {
        match self.kind(name) {
            None => Err(StationError::UnknownJob(name.to_string())),
            Some(registered) if registered != kind => Err(StationError::KindMismatch {
                name: name.to_string(),
                expected: registered,
            }),
            Some(_) => Ok(()),
        }
    }

    fn insert(&mut self, name: &str, handler: Handler<I, O>) -> Result<()> {
        if self.handlers.contains_key(name) {
            return Err(StationError::DuplicateJob(name.to_string()));
        }

        self.handlers.insert(name.to_string(), handler);

        Ok(())
    }
}

impl<I, O> Default for Registry<I, O> {
    fn default() -> Self { Self::new() }
}

#[test]
fn register_and_lookup() {
    let mut registry: Registry<u32, u32> = Registry::new();
    registry.register("double", |x| x * 2).unwrap();
    registry.register_workgroup("sum", |x, i| x + i, |a, b| a + b).unwrap();

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.kind("double"), Some(JobKind::Simple));
    assert_eq!(registry.kind("sum"), Some(JobKind::Workgroup));
    assert_eq!(registry.kind("missing"), None);

    match registry.get("double") {
        Some(Handler::Simple(f)) => assert_eq!(f(21), 42),
        _ => panic!("expected a simple handler"),
    }
}

#[test]
fn duplicate_registration() {
    let mut registry: Registry<u32, u32> = Registry::new();
    registry.register("double", |x| x * 2).unwrap();

    let res = registry.register_workgroup("double", |x, _| *x, |a, _| a);
    assert!(matches!(res, Err(StationError::DuplicateJob(name)) if name == "double"));
    assert_eq!(registry.kind("double"), Some(JobKind::Simple));
}

#[test]
fn kind_check() {
    let mut registry: Registry<u32, u32> = Registry::new();
    registry.register("double", |x| x * 2).unwrap();
    registry.register_workgroup("sum", |x, i| x + i, |a, b| a + b).unwrap();

    assert!(registry.check("double", JobKind::Simple).is_ok());
    assert!(registry.check("sum", JobKind::Workgroup).is_ok());
    assert!(matches!(
        registry.check("sum", JobKind::Simple),
        Err(StationError::KindMismatch { expected: JobKind::Workgroup, .. })
    ));
    assert!(matches!(
        registry.check("nope", JobKind::Simple),
        Err(StationError::UnknownJob(..))
    ));
}
