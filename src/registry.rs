use crate::meter::Meter;
use crate::sweeper;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

/// A registry of named meters.
///
/// The registry hands out shared [Meter] handles and supports pruning of
/// meters which have gone quiet, either by comparing totals between pruning
/// passes or against an explicit cut-off instant.
#[derive(Debug, Default)]
pub struct MeterRegistry {
    meters: RwLock<HashMap<String, RegistryEntry>>,
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the meter registered under the given name.
    pub fn get(&self, name: &str) -> Meter {
        if let Some(entry) = self.meters.read().get(name) {
            return entry.meter.clone();
        }

        self.meters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| RegistryEntry::new(Meter::new()))
            .meter
            .clone()
    }

    /// Remove the named meter from the registry.
    ///
    /// Idle meters don't consume any CPU, removing them only frees the memory.
    pub fn remove(&self, name: &str) {
        self.meters.write().remove(name);
    }

    /// Invoke the visitor for every meter in the registry.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &Meter),
    {
        for (name, entry) in self.meters.read().iter() {
            visitor(name, &entry.meter);
        }
    }

    /// Remove all meters from the registry.
    pub fn clear(&self) {
        self.meters.write().clear();
    }

    /// Trim every meter whose total hasn't advanced since the previous call
    /// and remember the current totals for the next one.
    ///
    /// Meters which joined the registry after the previous call always survive
    /// their first pass. It returns the number of trimmed and remaining meters.
    pub fn mark_and_trim_idle(&self) -> (usize, usize) {
        let sweeper = sweeper::global();
        // pause snapshotting so the walk observes a consistent view
        let _guard = sweeper.snapshot_read();
        let mut meters = self.meters.write();
        let mut trimmed = 0;

        meters.retain(|_, entry| {
            let total = entry.meter.inner.state.lock().snapshot.total;
            if entry.observed_total == Some(total) {
                trimmed += 1;
                return false;
            }

            entry.observed_total = Some(total);
            true
        });

        (trimmed, meters.len())
    }

    /// Find the names of all meters which haven't been updated since the given instant.
    pub fn find_idle(&self, since: Instant) -> Vec<String> {
        let mut idle = Vec::new();
        self.walk_idle(since, |name| idle.push(name.to_string()));
        idle
    }

    /// Remove all meters which haven't been updated since the given instant.
    /// It returns the number of meters which have been removed.
    pub fn trim_idle(&self, since: Instant) -> usize {
        let idle = self.find_idle(since);
        let mut meters = self.meters.write();
        for name in idle.iter() {
            meters.remove(name);
        }
        idle.len()
    }

    fn walk_idle<F>(&self, since: Instant, mut visitor: F)
    where
        F: FnMut(&str),
    {
        let sweeper = sweeper::global();
        // this takes the global lock, all it pauses however is snapshotting
        let _guard = sweeper.snapshot_read();

        for (name, entry) in self.meters.read().iter() {
            if entry.meter.inner.state.lock().snapshot.last_update < since {
                visitor(name);
            }
        }
    }
}

#[derive(Debug)]
struct RegistryEntry {
    meter: Meter,
    /// The total observed by the previous trim pass.
    observed_total: Option<u64>,
}

impl RegistryEntry {
    fn new(meter: Meter) -> Self {
        Self {
            meter,
            observed_total: None,
        }
    }
}
