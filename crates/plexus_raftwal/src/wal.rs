//! File-backed Raft WAL.
//!
//! One append-only log file and one snapshot file per group, written by a
//! dedicated worker thread so file handles have a single owner. Records are
//! framed as big-endian length + CRC32 + bincode payload; a torn tail record
//! is dropped on recovery. Storing a snapshot rewrites the log to the entries
//! past the snapshot index (rewrite-then-rename, so a crash leaves either the
//! old or the new log).

use std::collections::HashMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use anyhow::Context;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use plexus_replica::replica::{Entry, HardState, RaftWal, RecoveredState, Snapshot};

#[derive(Clone, Copy, Debug)]
enum SyncMode {
    None,
    Data,
    All,
}

fn sync_mode_from_env() -> SyncMode {
    match env::var("PLEXUS_WAL_SYNC_MODE").ok().as_deref() {
        Some("none") => SyncMode::None,
        Some("all") => SyncMode::All,
        _ => SyncMode::Data,
    }
}

#[derive(Serialize, Deserialize)]
enum WalRecord {
    HardState(HardState),
    Entry(Entry),
}

struct StoreWork {
    group: u32,
    hard_state: Option<HardState>,
    entries: Vec<Entry>,
    tx: mpsc::Sender<anyhow::Result<()>>,
}

struct SnapshotWork {
    group: u32,
    snapshot: Snapshot,
    tx: mpsc::Sender<anyhow::Result<()>>,
}

enum WalCommand {
    Store(StoreWork),
    StoreSnapshot(SnapshotWork),
}

pub struct FileWal {
    dir: PathBuf,
    tx: mpsc::Sender<WalCommand>,
}

impl FileWal {
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create wal dir")?;

        let sync_mode = sync_mode_from_env();
        let (tx, rx) = mpsc::channel();
        let worker_dir = dir.clone();
        thread::Builder::new()
            .name("raft-wal".to_string())
            .spawn(move || wal_worker(&worker_dir, rx, sync_mode))
            .context("spawn wal worker")?;

        Ok(Self { dir, tx })
    }

    fn roundtrip(&self, cmd: WalCommand, rx: mpsc::Receiver<anyhow::Result<()>>) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("wal worker closed"))?;
        rx.recv().context("wal response dropped")?
    }
}

impl RaftWal for FileWal {
    fn store(
        &self,
        group: u32,
        hard_state: Option<HardState>,
        entries: &[Entry],
    ) -> anyhow::Result<()> {
        if hard_state.is_none() && entries.is_empty() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel();
        self.roundtrip(
            WalCommand::Store(StoreWork {
                group,
                hard_state,
                entries: entries.to_vec(),
                tx,
            }),
            rx,
        )
    }

    fn store_snapshot(&self, group: u32, snapshot: &Snapshot) -> anyhow::Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel();
        self.roundtrip(
            WalCommand::StoreSnapshot(SnapshotWork {
                group,
                snapshot: snapshot.clone(),
                tx,
            }),
            rx,
        )
    }

    fn recover(&self, group: u32) -> anyhow::Result<RecoveredState> {
        let snapshot = read_snapshot_file(&snap_path(&self.dir, group))?;
        let (hard_state, mut entries) = read_log_records(&log_path(&self.dir, group))?;

        let snapshot_index = snapshot.as_ref().map_or(0, |s| s.metadata.index);
        entries.retain(|entry| entry.index > snapshot_index);

        let last_index = entries
            .last()
            .map_or(snapshot_index, |entry| entry.index)
            .max(snapshot_index);
        let restart =
            snapshot.is_some() || !hard_state.is_empty() || !entries.is_empty() || last_index > 0;

        Ok(RecoveredState {
            snapshot,
            hard_state,
            entries,
            last_index,
            restart,
        })
    }
}

fn log_path(dir: &Path, group: u32) -> PathBuf {
    dir.join(format!("group-{group}.log"))
}

fn snap_path(dir: &Path, group: u32) -> PathBuf {
    dir.join(format!("group-{group}.snap"))
}

fn wal_worker(dir: &Path, rx: mpsc::Receiver<WalCommand>, sync_mode: SyncMode) {
    let mut files: HashMap<u32, File> = HashMap::new();

    while let Ok(cmd) = rx.recv() {
        match cmd {
            WalCommand::Store(work) => {
                let res = append_store(dir, &mut files, &work, sync_mode);
                let _ = work.tx.send(res);
            }
            WalCommand::StoreSnapshot(work) => {
                let res = persist_snapshot(dir, &mut files, &work);
                let _ = work.tx.send(res);
            }
        }
    }
}

fn open_log_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn group_file<'a>(
    dir: &Path,
    files: &'a mut HashMap<u32, File>,
    group: u32,
) -> anyhow::Result<&'a mut File> {
    if !files.contains_key(&group) {
        let file = open_log_for_append(&log_path(dir, group)).context("open wal log")?;
        files.insert(group, file);
    }
    Ok(files.get_mut(&group).expect("wal file just inserted"))
}

fn append_store(
    dir: &Path,
    files: &mut HashMap<u32, File>,
    work: &StoreWork,
    sync_mode: SyncMode,
) -> anyhow::Result<()> {
    let file = group_file(dir, files, work.group)?;
    // Entries first, then the hard state that may commit them.
    for entry in &work.entries {
        let payload = bincode::serialize(&WalRecord::Entry(entry.clone()))
            .context("encode wal entry")?;
        write_record(file, &payload)?;
    }
    if let Some(hs) = work.hard_state {
        let payload =
            bincode::serialize(&WalRecord::HardState(hs)).context("encode wal hard state")?;
        write_record(file, &payload)?;
    }
    file.flush()?;
    sync_file(file, sync_mode)?;
    Ok(())
}

fn persist_snapshot(
    dir: &Path,
    files: &mut HashMap<u32, File>,
    work: &SnapshotWork,
) -> anyhow::Result<()> {
    let snap = snap_path(dir, work.group);
    let tmp = snap.with_extension("snap.tmp");
    {
        let mut out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .context("open snapshot temp")?;
        let payload = bincode::serialize(&work.snapshot).context("encode snapshot")?;
        write_record(&mut out, &payload)?;
        out.flush()?;
        out.sync_all()?;
    }
    fs::rename(&tmp, &snap).context("replace snapshot file")?;

    compact_log(dir, work.group, work.snapshot.metadata.index)?;
    // The worker's append handle points at the replaced file; reopen.
    files.remove(&work.group);
    tracing::debug!(
        group = work.group,
        index = work.snapshot.metadata.index,
        "wal snapshot stored"
    );
    Ok(())
}

/// Rewrite the log keeping only entries past `index` and the latest hard
/// state.
fn compact_log(dir: &Path, group: u32, index: u64) -> anyhow::Result<()> {
    let log = log_path(dir, group);
    let (hard_state, entries) = read_log_records(&log)?;

    let tmp = log.with_extension("log.tmp");
    let mut out = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)
        .context("open wal compact temp")?;

    if !hard_state.is_empty() {
        let payload =
            bincode::serialize(&WalRecord::HardState(hard_state)).context("encode wal hard state")?;
        write_record(&mut out, &payload)?;
    }
    let mut retained = 0usize;
    for entry in entries.iter().filter(|entry| entry.index > index) {
        let payload =
            bincode::serialize(&WalRecord::Entry(entry.clone())).context("encode wal entry")?;
        write_record(&mut out, &payload)?;
        retained += 1;
    }
    out.flush()?;
    out.sync_all()?;
    fs::rename(&tmp, &log).context("replace wal log")?;
    tracing::debug!(group, index, retained, "wal log compacted");
    Ok(())
}

fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn sync_file(file: &File, mode: SyncMode) -> std::io::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::Data => file.sync_data(),
        SyncMode::All => file.sync_all(),
    }
}

/// Replay the log: the latest hard state wins, and an entry at index `i`
/// truncates any previously read entries at `i` or above (a conflicting
/// append from a newer term).
fn read_log_records(path: &Path) -> anyhow::Result<(HardState, Vec<Entry>)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((HardState::default(), Vec::new()))
        }
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut hard_state = HardState::default();
    let mut entries: Vec<Entry> = Vec::new();

    while let Some(payload) = read_record(&mut reader)? {
        match bincode::deserialize(&payload).context("decode wal record")? {
            WalRecord::HardState(hs) => hard_state = hs,
            WalRecord::Entry(entry) => {
                while entries
                    .last()
                    .is_some_and(|last| last.index >= entry.index)
                {
                    entries.pop();
                }
                entries.push(entry);
            }
        }
    }
    Ok((hard_state, entries))
}

fn read_snapshot_file(path: &Path) -> anyhow::Result<Option<Snapshot>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let Some(payload) = read_record(&mut reader)? else {
        return Ok(None);
    };
    let snapshot: Snapshot = bincode::deserialize(&payload).context("decode snapshot")?;
    Ok(Some(snapshot))
}

/// Read one framed record. A clean EOF returns `None`; a torn tail (partial
/// frame or checksum mismatch) is treated the same way, since it can only be
/// the unsynced end of the last write.
fn read_record(reader: &mut impl Read) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut crc_buf = [0u8; 4];
    if reader.read_exact(&mut crc_buf).is_err() {
        return Ok(None);
    }
    let expected = u32::from_be_bytes(crc_buf);
    let mut payload = vec![0u8; len];
    if reader.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != expected {
        tracing::warn!("wal checksum mismatch at tail, dropping record");
        return Ok(None);
    }
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_replica::replica::{ConfState, EntryType, SnapshotMetadata};
    use tempfile::TempDir;

    fn entry(index: u64, term: u64) -> Entry {
        Entry {
            entry_type: EntryType::Normal,
            term,
            index,
            data: format!("entry-{index}").into_bytes(),
        }
    }

    #[test]
    fn store_and_recover_round_trips() {
        let dir = TempDir::new().unwrap();
        let wal = FileWal::open_dir(dir.path()).unwrap();

        let hs = HardState {
            term: 2,
            vote: 1,
            commit: 2,
        };
        wal.store(1, Some(hs), &[entry(1, 1), entry(2, 2)]).unwrap();

        let recovered = wal.recover(1).unwrap();
        assert!(recovered.restart);
        assert_eq!(recovered.hard_state, hs);
        assert_eq!(recovered.entries.len(), 2);
        assert_eq!(recovered.last_index, 2);
        assert!(recovered.snapshot.is_none());
    }

    #[test]
    fn fresh_dir_recovers_empty() {
        let dir = TempDir::new().unwrap();
        let wal = FileWal::open_dir(dir.path()).unwrap();
        let recovered = wal.recover(7).unwrap();
        assert!(!recovered.restart);
        assert_eq!(recovered.last_index, 0);
        assert!(recovered.entries.is_empty());
    }

    #[test]
    fn conflicting_entries_truncate_on_replay() {
        let dir = TempDir::new().unwrap();
        let wal = FileWal::open_dir(dir.path()).unwrap();

        wal.store(1, None, &[entry(1, 1), entry(2, 1), entry(3, 1)])
            .unwrap();
        // A new term overwrites the tail from index 2.
        wal.store(1, None, &[entry(2, 2)]).unwrap();

        let recovered = wal.recover(1).unwrap();
        assert_eq!(recovered.entries.len(), 2);
        assert_eq!(recovered.entries[1].index, 2);
        assert_eq!(recovered.entries[1].term, 2);
        assert_eq!(recovered.last_index, 2);
    }

    #[test]
    fn snapshot_compacts_log_and_survives_recovery() {
        let dir = TempDir::new().unwrap();
        let wal = FileWal::open_dir(dir.path()).unwrap();

        let entries: Vec<Entry> = (1..=10).map(|i| entry(i, 1)).collect();
        wal.store(1, None, &entries).unwrap();

        let snapshot = Snapshot {
            data: b"ctx".to_vec(),
            metadata: SnapshotMetadata {
                conf_state: ConfState { nodes: vec![1] },
                index: 8,
                term: 1,
            },
        };
        wal.store_snapshot(1, &snapshot).unwrap();

        let recovered = wal.recover(1).unwrap();
        let snap = recovered.snapshot.expect("snapshot recovered");
        assert_eq!(snap.metadata.index, 8);
        assert_eq!(snap.data, b"ctx");
        assert_eq!(
            recovered.entries.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![9, 10]
        );
        assert_eq!(recovered.last_index, 10);

        // Appends after compaction land in the reopened log.
        wal.store(1, None, &[entry(11, 2)]).unwrap();
        let recovered = wal.recover(1).unwrap();
        assert_eq!(recovered.last_index, 11);
    }

    #[test]
    fn groups_are_isolated() {
        let dir = TempDir::new().unwrap();
        let wal = FileWal::open_dir(dir.path()).unwrap();
        wal.store(1, None, &[entry(1, 1)]).unwrap();
        wal.store(2, None, &[entry(5, 1)]).unwrap();

        assert_eq!(wal.recover(1).unwrap().last_index, 1);
        assert_eq!(wal.recover(2).unwrap().last_index, 5);
    }
}
