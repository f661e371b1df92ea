//! Raft log storage for plexus replica groups.
//!
//! [`FileWal`] persists entries, hard state, and snapshots per group in
//! CRC-framed append-only files; [`MemoryLog`] is the in-memory store the
//! consensus engine replays from. Both implement the narrow interfaces
//! declared by `plexus_replica`.

mod memory;
mod wal;

pub use memory::MemoryLog;
pub use wal::FileWal;
