//! In-memory log store.
//!
//! Holds the suffix of the log past the latest snapshot, plus the hard state.
//! Written only by the run loop; read by the engine and the snapshot path.
//! Entry `i` lives at `entries[i - snapshot_index - 1]`.

use std::sync::RwLock;

use plexus_replica::replica::{ConfState, Entry, HardState, LogStorage, Snapshot, SnapshotMetadata};

pub struct MemoryLog {
    inner: RwLock<Inner>,
}

struct Inner {
    hard_state: HardState,
    snapshot: Snapshot,
    entries: Vec<Entry>,
}

impl Inner {
    fn first_index(&self) -> u64 {
        self.snapshot.metadata.index + 1
    }

    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(entry) => entry.index,
            None => self.snapshot.metadata.index,
        }
    }

    fn term(&self, index: u64) -> anyhow::Result<u64> {
        if index == self.snapshot.metadata.index {
            return Ok(self.snapshot.metadata.term);
        }
        anyhow::ensure!(
            index >= self.first_index() && index <= self.last_index(),
            "term for index {index} is out of range [{}, {}]",
            self.first_index(),
            self.last_index()
        );
        let offset = (index - self.first_index()) as usize;
        Ok(self.entries[offset].term)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                hard_state: HardState::default(),
                snapshot: Snapshot::default(),
                entries: Vec::new(),
            }),
        }
    }

    pub fn hard_state(&self) -> HardState {
        self.inner.read().expect("memory log lock").hard_state
    }
}

impl LogStorage for MemoryLog {
    fn append(&self, hard_state: Option<HardState>, entries: &[Entry]) -> anyhow::Result<()> {
        let mut inner = self.inner.write().expect("memory log lock");
        if let Some(hs) = hard_state {
            inner.hard_state = hs;
        }
        let Some(first_new) = entries.first().map(|e| e.index) else {
            return Ok(());
        };
        anyhow::ensure!(
            first_new >= inner.first_index(),
            "appending at {first_new} below compacted index {}",
            inner.first_index()
        );
        anyhow::ensure!(
            first_new <= inner.last_index() + 1,
            "log gap: appending at {first_new} past last index {}",
            inner.last_index()
        );
        // A conflicting append truncates everything from the overlap on.
        let keep = (first_new - inner.first_index()) as usize;
        inner.entries.truncate(keep);
        inner.entries.extend_from_slice(entries);
        Ok(())
    }

    fn apply_snapshot(&self, snapshot: Snapshot) -> anyhow::Result<()> {
        let mut inner = self.inner.write().expect("memory log lock");
        anyhow::ensure!(
            snapshot.metadata.index >= inner.snapshot.metadata.index,
            "snapshot at {} is older than current {}",
            snapshot.metadata.index,
            inner.snapshot.metadata.index
        );
        inner.hard_state.commit = inner.hard_state.commit.max(snapshot.metadata.index);
        inner.entries.clear();
        inner.snapshot = snapshot;
        Ok(())
    }

    fn snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(self.inner.read().expect("memory log lock").snapshot.clone())
    }

    fn create_snapshot(
        &self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> anyhow::Result<Snapshot> {
        let mut inner = self.inner.write().expect("memory log lock");
        anyhow::ensure!(
            index > inner.snapshot.metadata.index,
            "snapshot at {index} not newer than existing {}",
            inner.snapshot.metadata.index
        );
        anyhow::ensure!(
            index <= inner.last_index(),
            "snapshot at {index} past last index {}",
            inner.last_index()
        );
        let term = inner.term(index)?;
        let snapshot = Snapshot {
            data,
            metadata: SnapshotMetadata {
                conf_state,
                index,
                term,
            },
        };
        inner.snapshot = snapshot.clone();
        Ok(snapshot)
    }

    fn compact(&self, index: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.write().expect("memory log lock");
        if index < inner.first_index() {
            return Ok(());
        }
        anyhow::ensure!(
            index <= inner.last_index(),
            "compact at {index} past last index {}",
            inner.last_index()
        );
        let drop = (index + 1 - inner.first_index()) as usize;
        inner.entries.drain(..drop);
        Ok(())
    }

    fn first_index(&self) -> u64 {
        self.inner.read().expect("memory log lock").first_index()
    }

    fn last_index(&self) -> u64 {
        self.inner.read().expect("memory log lock").last_index()
    }
}
