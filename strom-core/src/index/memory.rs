//! In-memory file set.
//!
//! Backs tests and small hosts. Snapshots clone the current state, which
//! keeps them trivially consistent; the durable engine used in production
//! implements the same traits over its own storage.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use strom_model::{BlocksHash, DeviceId, FileRecord, VersionOrdering};

use super::{FileSet, IndexSnapshot};

#[derive(Default)]
pub struct MemoryFileSet {
    inner: RwLock<Inner>,
}

#[derive(Default, Clone)]
struct Inner {
    devices: HashMap<DeviceId, BTreeMap<String, FileRecord>>,
    sequences: HashMap<DeviceId, u64>,
}

impl MemoryFileSet {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSet for MemoryFileSet {
    fn snapshot(&self) -> Box<dyn IndexSnapshot> {
        let inner = self.inner.read().expect("file set poisoned").clone();
        Box::new(MemorySnapshot { inner })
    }

    fn update(&self, device: DeviceId, records: Vec<FileRecord>) {
        let mut inner = self.inner.write().expect("file set poisoned");
        let mut next = inner.sequences.get(&device).copied().unwrap_or(0);
        let table = inner.devices.entry(device).or_default();
        for mut record in records {
            next += 1;
            record.sequence = next;
            table.insert(record.name.clone(), record);
        }
        inner.sequences.insert(device, next);
    }

    fn sequence(&self, device: DeviceId) -> u64 {
        self.inner
            .read()
            .expect("file set poisoned")
            .sequences
            .get(&device)
            .copied()
            .unwrap_or(0)
    }
}

struct MemorySnapshot {
    inner: Inner,
}

impl MemorySnapshot {
    fn global_for(&self, name: &str) -> Option<FileRecord> {
        let mut best: Option<&FileRecord> = None;
        for table in self.inner.devices.values() {
            let Some(candidate) = table.get(name) else {
                continue;
            };
            best = Some(match best {
                None => candidate,
                Some(current) => elect(current, candidate),
            });
        }
        best.cloned()
    }

    fn global_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for table in self.inner.devices.values() {
            for name in table.keys() {
                names.insert(name.clone());
            }
        }
        names
    }
}

/// Pick the better of two candidates for the global view: valid beats
/// invalid, then the newer version wins; concurrent edits fall back to the
/// later modification time.
fn elect<'a>(current: &'a FileRecord, candidate: &'a FileRecord) -> &'a FileRecord {
    match (current.is_invalid(), candidate.is_invalid()) {
        (false, true) => return current,
        (true, false) => return candidate,
        _ => {}
    }
    match candidate.version.compare(&current.version) {
        VersionOrdering::Greater => candidate,
        VersionOrdering::Equal | VersionOrdering::Lesser => current,
        VersionOrdering::Concurrent => {
            if candidate.modified_ns > current.modified_ns {
                candidate
            } else {
                current
            }
        }
    }
}

impl IndexSnapshot for MemorySnapshot {
    fn get(&self, device: DeviceId, name: &str) -> Option<FileRecord> {
        self.inner.devices.get(&device)?.get(name).cloned()
    }

    fn get_global(&self, name: &str) -> Option<FileRecord> {
        self.global_for(name)
    }

    fn have_prefixed<'a>(
        &'a self,
        device: DeviceId,
        prefix: &str,
    ) -> Box<dyn Iterator<Item = FileRecord> + 'a> {
        let prefix = prefix.to_string();
        let Some(table) = self.inner.devices.get(&device) else {
            return Box::new(std::iter::empty());
        };
        Box::new(table.values().filter_map(move |record| {
            if prefix.is_empty()
                || record.name == prefix
                || crate::paths::is_parent(&record.name, &prefix)
            {
                Some(record.clone())
            } else {
                None
            }
        }))
    }

    fn need<'a>(&'a self, device: DeviceId) -> Box<dyn Iterator<Item = FileRecord> + 'a> {
        let names: Vec<String> = self.global_names().into_iter().collect();
        let mut needed = Vec::new();
        for name in names {
            let Some(global) = self.global_for(&name) else {
                continue;
            };
            if global.is_invalid() {
                continue;
            }
            let wanted = match self.get(device, &name) {
                None => !global.is_deleted(),
                Some(local) => {
                    local.version != global.version && !(local.is_deleted() && global.is_deleted())
                }
            };
            if wanted {
                needed.push(global);
            }
        }
        Box::new(needed.into_iter())
    }

    fn with_blocks_hash<'a>(
        &'a self,
        hash: &BlocksHash,
    ) -> Box<dyn Iterator<Item = FileRecord> + 'a> {
        let hash = *hash;
        let Some(table) = self.inner.devices.get(&DeviceId::LOCAL) else {
            return Box::new(std::iter::empty());
        };
        Box::new(
            table
                .values()
                .filter(move |record| record.blocks_hash == Some(hash))
                .cloned(),
        )
    }

    fn availability(&self, name: &str) -> Vec<DeviceId> {
        self.inner
            .devices
            .iter()
            .filter(|(device, table)| {
                **device != DeviceId::LOCAL
                    && table
                        .get(name)
                        .is_some_and(|record| !record.is_deleted() && !record.is_invalid())
            })
            .map(|(device, _)| *device)
            .collect()
    }
}
