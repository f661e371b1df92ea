//! Replication core for a single plexus shard group.
//!
//! This crate drives one replicated state machine per (process, group): it
//! consumes the Ready protocol of an external Raft engine, applies committed
//! proposals to the posting store in log order, and coordinates linearizable
//! reads, snapshotting, and membership changes. Storage, consensus, and the
//! cluster directory are supplied by the embedding process through the traits
//! in [`replica`].

pub mod replica;
