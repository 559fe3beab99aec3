use serde::{Deserialize, Serialize};

use crate::ids::ShortDeviceId;

/// One device's change counter inside a version vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counter {
    pub id: ShortDeviceId,
    pub value: u64,
}

/// Version vector for an index entry. Counters are kept sorted by device id
/// so equality is structural.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    counters: Vec<Counter>,
}

/// Relation between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    Equal,
    Greater,
    Lesser,
    Concurrent,
}

impl Version {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    fn counter_for(&self, id: ShortDeviceId) -> u64 {
        self.counters
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.value)
            .unwrap_or(0)
    }

    /// Record a change made by `id`: the device's counter jumps past every
    /// counter already present, so the updated vector is greater than the old.
    pub fn update(&mut self, id: ShortDeviceId) {
        let max = self.counters.iter().map(|c| c.value).max().unwrap_or(0);
        match self.counters.iter_mut().find(|c| c.id == id) {
            Some(c) => c.value = max + 1,
            None => {
                self.counters.push(Counter { id, value: max + 1 });
                self.counters.sort_by_key(|c| c.id);
            }
        }
    }

    pub fn updated(mut self, id: ShortDeviceId) -> Self {
        self.update(id);
        self
    }

    pub fn compare(&self, other: &Version) -> VersionOrdering {
        let mut greater = false;
        let mut lesser = false;
        for c in &self.counters {
            let o = other.counter_for(c.id);
            if c.value > o {
                greater = true;
            } else if c.value < o {
                lesser = true;
            }
        }
        for o in &other.counters {
            if self.counter_for(o.id) < o.value {
                lesser = true;
            }
        }
        match (greater, lesser) {
            (false, false) => VersionOrdering::Equal,
            (true, false) => VersionOrdering::Greater,
            (false, true) => VersionOrdering::Lesser,
            (true, true) => VersionOrdering::Concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(n: u64) -> ShortDeviceId {
        ShortDeviceId(n)
    }

    #[test]
    fn update_makes_strictly_greater() {
        let mut a = Version::new();
        a.update(short(1));
        let b = a.clone().updated(short(2));
        assert_eq!(b.compare(&a), VersionOrdering::Greater);
        assert_eq!(a.compare(&b), VersionOrdering::Lesser);
    }

    #[test]
    fn diverging_updates_are_concurrent() {
        let mut base = Version::new();
        base.update(short(1));
        let a = base.clone().updated(short(2));
        let b = base.clone().updated(short(3));
        assert_eq!(a.compare(&b), VersionOrdering::Concurrent);
    }

    #[test]
    fn empty_vectors_are_equal() {
        assert_eq!(Version::new().compare(&Version::new()), VersionOrdering::Equal);
    }
}
