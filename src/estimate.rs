//! Per job-type duration estimates.
//!
//! The station predicts how long a job will take from the running arithmetic
//! mean of the durations observed for its job type. Durations are expressed
//! in milliseconds.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// A read-only copy of the estimate table: job-type name to mean duration.
///
/// This is what gets persisted between runs and fed back to
/// `StationBuilder::with_time_snapshot` to warm up the estimates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSnapshot(pub BTreeMap<String, f64>);

impl TimeSnapshot {
    pub fn new() -> Self { TimeSnapshot(BTreeMap::new()) }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: &str, duration: f64) {
        self.0.insert(name.to_string(), duration);
    }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, mean)| (name.as_str(), *mean))
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for TimeSnapshot {
    fn from_iter<T: IntoIterator<Item = (S, f64)>>(iter: T) -> Self {
        TimeSnapshot(iter.into_iter().map(|(name, mean)| (name.into(), mean)).collect())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Estimate {
    // Number of observed samples. Seeded entries start at zero so that the
    // first observation replaces the seed.
    samples: u64,
    mean: f64,
}

pub struct EstimateTable {
    entries: HashMap<String, Estimate>,
    fallback: f64,
}

impl EstimateTable {
    pub fn new(fallback: f64) -> Self {
        EstimateTable {
            entries: HashMap::new(),
            fallback,
        }
    }

    pub fn with_snapshot(snapshot: &TimeSnapshot, fallback: f64) -> Self {
        let mut table = EstimateTable::new(fallback);
        for (name, mean) in snapshot.iter() {
            table.entries.insert(name.to_string(), Estimate { samples: 0, mean });
        }

        table
    }

    /// The predicted duration of a job of this type, or the fallback if
    /// nothing is known about it yet.
    pub fn lookup(&self, name: &str) -> f64 {
        self.entries.get(name).map_or(self.fallback, |e| e.mean)
    }

    /// Fold one observed duration into the mean of its job type.
    pub fn record_sample(&mut self, name: &str, observed: f64) {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.samples += 1;
                let n = entry.samples as f64;
                entry.mean = (entry.mean * (n - 1.0) + observed) / n;
            }
            None => {
                self.entries.insert(name.to_string(), Estimate { samples: 1, mean: observed });
            }
        }
    }

    /// Number of observations recorded for this job type (seeds excluded).
    pub fn samples(&self, name: &str) -> u64 {
        self.entries.get(name).map_or(0, |e| e.samples)
    }

    pub fn fallback(&self) -> f64 { self.fallback }

    pub fn snapshot(&self) -> TimeSnapshot {
        self.entries.iter().map(|(name, e)| (name.as_str(), e.mean)).collect()
    }
}

#[test]
fn running_mean() {
    let mut table = EstimateTable::new(10.0);
    assert_eq!(table.lookup("add"), 10.0);

    for d in [4.0, 6.0, 5.0] {
        table.record_sample("add", d);
    }

    assert!((table.lookup("add") - 5.0).abs() < 1e-9);
    assert_eq!(table.samples("add"), 3);
    assert_eq!(table.lookup("mul"), 10.0);
}

#[test]
fn running_mean_many_samples() {
    let mut table = EstimateTable::new(10.0);
    let samples: Vec<f64> = (1..=1000).map(|i| (i % 37) as f64 * 0.25).collect();
    for d in &samples {
        table.record_sample("work", *d);
    }

    let expected = samples.iter().sum::<f64>() / samples.len() as f64;
    assert!((table.lookup("work") - expected).abs() < 1e-9);
}

#[test]
fn seeded_estimates() {
    let snapshot: TimeSnapshot = [("add", 2.0), ("mul", 7.5)].into_iter().collect();
    let mut table = EstimateTable::with_snapshot(&snapshot, 10.0);

    assert_eq!(table.lookup("add"), 2.0);
    assert_eq!(table.samples("add"), 0);
    assert_eq!(table.snapshot(), snapshot);

    // The first observation replaces the seed.
    table.record_sample("add", 4.0);
    assert_eq!(table.lookup("add"), 4.0);
    table.record_sample("add", 6.0);
    assert_eq!(table.lookup("add"), 5.0);

    let snapshot = table.snapshot();
    assert_eq!(snapshot.get("add"), Some(5.0));
    assert_eq!(snapshot.get("mul"), Some(7.5));
    assert_eq!(snapshot.len(), 2);
}

#[test]
fn snapshot_persistence() {
    let mut table = EstimateTable::new(10.0);
    table.record_sample("add", 3.0);
    table.record_sample("blur", 12.5);

    let json = serde_json::to_string(&table.snapshot()).unwrap();
    assert_eq!(json, r#"{"add":3.0,"blur":12.5}"#);

    let restored: TimeSnapshot = serde_json::from_str(&json).unwrap();
    let table = EstimateTable::with_snapshot(&restored, 10.0);
    assert_eq!(table.lookup("blur"), 12.5);
}
