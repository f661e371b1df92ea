//! Surface of the external Raft engine.
//!
//! The consensus algorithm lives outside this crate and is consumed as an
//! oracle. `Ready` batches follow the classic etcd protocol: entries, hard
//! state, and snapshot must be persisted before committed entries are applied
//! or peers acknowledged, then the engine is advanced. The engine delivers
//! `Ready` batches over the channel returned by [`RaftBootstrap`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Index sentinel meaning "no index": a failed ReadIndex or an unset field.
pub const RAFT_NONE: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Normal,
    ConfChange,
}

/// One position in the replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub entry_type: EntryType,
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

/// Raft state that must be durable before messages are sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

/// Voting membership as known to the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfState {
    pub nodes: Vec<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub conf_state: ConfState,
    pub index: u64,
    pub term: u64,
}

/// A point-in-time log prefix replacement. `data` carries the marshaled
/// [`crate::replica::RaftContext`] of the sender, not state machine data;
/// actual state is streamed from the group leader on install.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub data: Vec<u8>,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    /// Mirrors `raft.IsEmptySnap`: a zero metadata index means "no snapshot".
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeType {
    AddNode,
    RemoveNode,
}

/// Membership change entry payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfChange {
    pub id: u64,
    pub change_type: ConfChangeType,
    pub node_id: u64,
    /// Marshaled `RaftContext` of the joining peer; empty on removal.
    pub context: Vec<u8>,
}

/// Response to a ReadIndex request. `request_ctx` echoes the token passed to
/// [`RaftEngine::read_index`].
#[derive(Clone, Debug)]
pub struct ReadState {
    pub index: u64,
    pub request_ctx: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateRole {
    Follower,
    Candidate,
    Leader,
}

/// Volatile role information; absent from a `Ready` when unchanged.
#[derive(Clone, Copy, Debug)]
pub struct SoftState {
    pub leader_id: u64,
    pub raft_state: StateRole,
}

/// An outgoing Raft protocol message. The payload is opaque wire bytes owned
/// by the engine; `context` is overwritten by the run loop with this node's
/// marshaled `RaftContext` so peers can establish transport without prior
/// configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub to: u64,
    pub from: u64,
    pub context: Vec<u8>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
pub struct RaftStatus {
    pub id: u64,
    pub lead: u64,
    pub raft_state: StateRole,
}

/// One batch of work from the engine. Field order matches the required
/// handling order; `committed_entries` only ever contains entries whose
/// predecessors were already delivered.
#[derive(Debug, Default)]
pub struct Ready {
    pub soft_state: Option<SoftState>,
    pub hard_state: Option<HardState>,
    pub read_states: Vec<ReadState>,
    pub entries: Vec<Entry>,
    pub snapshot: Snapshot,
    pub committed_entries: Vec<Entry>,
    pub messages: Vec<Message>,
}

/// Identity handed to [`RaftBootstrap::start`] for a bootstrap peer set.
#[derive(Clone, Copy, Debug)]
pub struct RaftPeer {
    pub id: u64,
}

/// Engine construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct RaftConfig {
    pub id: u64,
    pub group: u32,
    /// Index the state machine has already applied; replay starts after it.
    pub applied: u64,
}

/// Driving surface of a running Raft engine.
#[async_trait]
pub trait RaftEngine: Send + Sync + 'static {
    /// Advance the logical clock by one tick.
    fn tick(&self);

    /// Append `data` to the log, subject to quorum. Returns once the entry
    /// is accepted for replication, not once committed.
    async fn propose(&self, data: Vec<u8>) -> anyhow::Result<()>;

    async fn propose_conf_change(&self, cc: ConfChange) -> anyhow::Result<()>;

    /// Request the current commit index; the engine answers with a
    /// `ReadState` echoing `rctx` in a later `Ready`.
    async fn read_index(&self, rctx: Vec<u8>) -> anyhow::Result<()>;

    /// Apply a committed membership change and return the new `ConfState`.
    fn apply_conf_change(&self, cc: &ConfChange) -> ConfState;

    async fn campaign(&self) -> anyhow::Result<()>;

    async fn transfer_leadership(&self, transferee: u64);

    fn status(&self) -> RaftStatus;

    /// Acknowledge the most recent `Ready` so the engine can produce the next.
    fn advance(&self);

    fn stop(&self);
}

/// Factory for the two engine start modes. Implementations close over the
/// log storage the engine replays from; the returned receiver is the `Ready`
/// feed consumed by the run loop.
pub trait RaftBootstrap: Send + Sync {
    /// Restart from previously persisted state.
    fn restart(&self, cfg: RaftConfig) -> (Arc<dyn RaftEngine>, mpsc::Receiver<Ready>);

    /// Start fresh. `peers` is empty when the node will join an existing
    /// cluster, or contains only this node for a single-node group.
    fn start(
        &self,
        cfg: RaftConfig,
        peers: Vec<RaftPeer>,
    ) -> (Arc<dyn RaftEngine>, mpsc::Receiver<Ready>);
}
