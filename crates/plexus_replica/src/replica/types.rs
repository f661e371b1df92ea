//! Shared types for the replication core.
//!
//! Log payloads, the identities exchanged through Raft message contexts, and
//! the traits through which the node consumes its collaborators: the posting
//! store, the MVCC oracle, the cluster directory, the Raft WAL, and the
//! in-memory log store. The consensus engine surface lives in [`super::raft`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::raft::{ConfState, Entry, HardState, Message, Snapshot};

/// Identity stamped into Raft message contexts and snapshot payloads so peers
/// can establish transport without prior configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftContext {
    pub id: u64,
    pub group: u32,
    pub addr: String,
}

impl RaftContext {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        bincode::serialize(self).context("encode raft context")
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        bincode::deserialize(bytes).context("decode raft context")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    #[default]
    Default,
    String,
    Int,
    Float,
    Bool,
    Uid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeOp {
    Set,
    Delete,
}

/// One graph-edge mutation: subject entity, predicate, and object value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub entity: u64,
    pub attr: String,
    pub value: Vec<u8>,
    pub value_type: ValueType,
    pub op: EdgeOp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaUpdate {
    pub predicate: String,
    pub value_type: ValueType,
    pub index: bool,
}

/// Edge and schema mutations applied under one transaction start timestamp.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Mutations {
    pub edges: Vec<Edge>,
    pub schema: Vec<SchemaUpdate>,
    pub start_ts: u64,
}

/// Bulk key/value row streamed during snapshot transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Commit or abort decision for a transaction. `commit_ts == 0` or `aborted`
/// discards the transaction's deltas.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TxnContext {
    pub start_ts: u64,
    pub commit_ts: u64,
    pub aborted: bool,
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub group_id: u32,
    pub addr: String,
    pub leader: bool,
}

/// Predicate to group ownership. Read-only while the tablet moves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tablet {
    pub predicate: String,
    pub group_id: u32,
    pub read_only: bool,
}

/// Cluster membership snapshot distributed by group zero.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MembershipState {
    pub counter: u64,
    pub members: HashMap<u64, Member>,
    pub tablets: HashMap<String, Tablet>,
}

/// A client-submitted unit of work serialized into the Raft log. Exactly one
/// facet is populated; `key` correlates the committed entry back to the
/// in-flight proposal on the node that originated it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Proposal {
    pub key: String,
    /// Numeric id written by older releases; rewritten to the decimal string
    /// form of `key` before apply. Decimal strings cannot collide with the
    /// 32-char hex keys generated today.
    pub deprecated_id: u64,
    pub mutations: Option<Mutations>,
    pub kv: Vec<KvPair>,
    pub state: Option<MembershipState>,
    pub clean_predicate: String,
    pub txn_context: Option<TxnContext>,
}

impl Proposal {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        bincode::serialize(self).context("encode proposal")
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        bincode::deserialize(bytes).context("decode proposal")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sequencing {
    ClientSide,
    ServerSide,
}

/// Client read-sequencing demand: either full linearizability or a minimum
/// applied index per group observed by the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinRead {
    pub sequencing: Sequencing,
    pub ids: HashMap<u32, u64>,
}

/// Fixed-width frame correlating RPC messages to a proposal: little-endian
/// `u32` proposal id followed by `u16` message id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub proposal_id: u32,
    pub msg_id: u16,
}

impl Header {
    pub const LENGTH: usize = 6;

    pub fn encode(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[0..4].copy_from_slice(&self.proposal_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.msg_id.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(buf.len() >= Self::LENGTH, "header frame too short");
        Ok(Self {
            proposal_id: u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice")),
            msg_id: u16::from_le_bytes(buf[4..6].try_into().expect("2-byte slice")),
        })
    }
}

/// Explicit apply-site metadata handed to the posting store with every
/// mutation, replacing ambient context values.
#[derive(Clone, Copy, Debug)]
pub struct ApplyContext {
    pub group: u32,
    pub index: u64,
}

/// A peer's transport identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub addr: String,
}

/// Posting-store transaction the scheduler applies edge mutations to. Tracks
/// the Raft indices of the mutation proposals applied under it so the txn
/// watermark can be resolved when the transaction commits or aborts.
#[derive(Debug)]
pub struct Txn {
    start_ts: u64,
    aborted: AtomicBool,
    indices: Mutex<Vec<u64>>,
}

impl Txn {
    pub fn new(start_ts: u64) -> Self {
        Self {
            start_ts,
            aborted: AtomicBool::new(false),
            indices: Mutex::new(Vec::new()),
        }
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn should_abort(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn set_abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn add_index(&self, index: u64) {
        let mut indices = self.indices.lock().expect("txn indices lock");
        if !indices.contains(&index) {
            indices.push(index);
        }
    }

    pub fn indices(&self) -> Vec<u64> {
        self.indices.lock().expect("txn indices lock").clone()
    }
}

/// Posting store driven by the apply pipeline. Internally concurrent; the
/// replication layer only serializes writes that share a key.
#[async_trait]
pub trait PostingStore: Send + Sync + 'static {
    async fn run_mutation(
        &self,
        ctx: ApplyContext,
        edge: &Edge,
        txn: &Txn,
    ) -> anyhow::Result<()>;

    async fn run_schema_mutation(
        &self,
        ctx: ApplyContext,
        schema: &[SchemaUpdate],
        start_ts: u64,
    ) -> anyhow::Result<()>;

    async fn delete_predicate(&self, ctx: ApplyContext, predicate: &str) -> anyhow::Result<()>;

    /// Bulk ingest streamed key/value rows during snapshot transfer.
    async fn ingest_key_values(&self, kvs: &[KvPair]) -> anyhow::Result<()>;

    /// Write a transaction's deltas at its commit timestamp, or discard them.
    async fn commit_or_abort(&self, tctx: &TxnContext) -> anyhow::Result<()>;

    /// Drop cached posting lists before streaming a snapshot over them.
    fn evict_cache(&self);

    /// Stream this group's data from the leader directly into the store.
    async fn populate_shard(&self, leader: &Peer) -> anyhow::Result<usize>;

    /// Reload the schema registry after data was streamed under it.
    async fn load_schema(&self) -> anyhow::Result<()>;

    fn schema(&self, predicate: &str) -> Option<SchemaUpdate>;
}

/// MVCC oracle issuing transaction timestamps and tracking their status.
#[async_trait]
pub trait Oracle: Send + Sync + 'static {
    /// Return the transaction for `start_ts`, creating it if unseen. Repeat
    /// calls with the same timestamp return the same transaction.
    fn register(&self, start_ts: u64) -> std::sync::Arc<Txn>;

    fn lookup(&self, start_ts: u64) -> Option<std::sync::Arc<Txn>>;

    /// Block until the oracle has observed commit information up to
    /// `start_ts`. Mutations must not read posting state from before it.
    async fn wait_for_ts(&self, start_ts: u64);

    fn done(&self, start_ts: u64);

    /// Start timestamps of transactions still open since the last snapshot,
    /// oldest first, capped by `pending`.
    fn txns_since_snapshot(&self, pending: u64) -> Vec<u64>;
}

/// Cluster directory ("zero"): tablet ownership, leadership, membership.
#[async_trait]
pub trait ClusterView: Send + Sync + 'static {
    fn group_id(&self) -> u32;

    fn tablet(&self, predicate: &str) -> Option<Tablet>;

    fn leader(&self, group: u32) -> Option<Peer>;

    /// Some peer of this node's group, if the group has more than one member.
    fn my_peer(&self) -> Option<u64>;

    fn members(&self, group: u32) -> HashMap<u64, Member>;

    fn trigger_membership_sync(&self);

    fn apply_state(&self, state: MembershipState);

    async fn update_membership_state(&self) -> anyhow::Result<()>;

    /// Ask the group leader to add this node to the Raft group.
    async fn join_cluster(&self, leader: &Peer, rc: &RaftContext) -> anyhow::Result<()>;

    /// Ask the group leader whether this node is already a member.
    async fn is_peer(&self, leader: &Peer, rc: &RaftContext) -> anyhow::Result<bool>;

    /// Ask group zero to abort the given transactions if not yet committed.
    async fn try_abort(&self, start_timestamps: Vec<u64>) -> anyhow::Result<()>;
}

/// Outbound transport for Raft protocol messages.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn send(&self, peer: Peer, batch: Vec<Message>) -> anyhow::Result<()>;
}

/// State recovered from the durable Raft log at startup.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub snapshot: Option<Snapshot>,
    pub hard_state: HardState,
    pub entries: Vec<Entry>,
    /// Highest index found across snapshot and entries.
    pub last_index: u64,
    /// True when any prior state was found; drives the restart branch.
    pub restart: bool,
}

/// Durable Raft log. Entries and hard state must be persisted before the
/// in-memory store or any outbound acknowledgment.
pub trait RaftWal: Send + Sync + 'static {
    fn store(
        &self,
        group: u32,
        hard_state: Option<HardState>,
        entries: &[Entry],
    ) -> anyhow::Result<()>;

    fn store_snapshot(&self, group: u32, snapshot: &Snapshot) -> anyhow::Result<()>;

    fn recover(&self, group: u32) -> anyhow::Result<RecoveredState>;
}

/// In-memory log store the engine replays from.
pub trait LogStorage: Send + Sync + 'static {
    fn append(&self, hard_state: Option<HardState>, entries: &[Entry]) -> anyhow::Result<()>;

    fn apply_snapshot(&self, snapshot: Snapshot) -> anyhow::Result<()>;

    fn snapshot(&self) -> anyhow::Result<Snapshot>;

    fn create_snapshot(
        &self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> anyhow::Result<Snapshot>;

    /// Discard log entries up to and including `index`.
    fn compact(&self, index: u64) -> anyhow::Result<()>;

    fn first_index(&self) -> u64;

    fn last_index(&self) -> u64;
}

/// Reject schema updates that could not be stored or indexed.
pub fn check_schema(update: &SchemaUpdate) -> anyhow::Result<()> {
    anyhow::ensure!(!update.predicate.is_empty(), "schema predicate is empty");
    anyhow::ensure!(
        !update.predicate.starts_with('_'),
        "predicate {} is reserved",
        update.predicate
    );
    if update.index {
        anyhow::ensure!(
            update.value_type != ValueType::Default,
            "cannot index predicate {} without a value type",
            update.predicate
        );
    }
    Ok(())
}

/// Best-effort conversion check against the registered schema type. Invalid
/// values are rejected before consensus; entries that slip through are still
/// checked at apply time by the store.
pub fn validate_and_convert(edge: &Edge, schema: &SchemaUpdate) -> anyhow::Result<()> {
    if edge.op == EdgeOp::Delete {
        return Ok(());
    }
    let text = || std::str::from_utf8(&edge.value).context("edge value is not utf-8");
    match schema.value_type {
        ValueType::Default | ValueType::String => Ok(()),
        ValueType::Int => {
            let text = text()?;
            text.parse::<i64>()
                .with_context(|| format!("cannot convert {text:?} to int for {}", edge.attr))?;
            Ok(())
        }
        ValueType::Float => {
            let text = text()?;
            text.parse::<f64>()
                .with_context(|| format!("cannot convert {text:?} to float for {}", edge.attr))?;
            Ok(())
        }
        ValueType::Bool => {
            let text = text()?;
            text.parse::<bool>()
                .with_context(|| format!("cannot convert {text:?} to bool for {}", edge.attr))?;
            Ok(())
        }
        ValueType::Uid => {
            anyhow::ensure!(
                edge.value.len() == 8,
                "uid value for {} must be 8 bytes",
                edge.attr
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header {
            proposal_id: 0xdead_beef,
            msg_id: 0x0102,
        };
        let buf = header.encode();
        assert_eq!(buf.len(), Header::LENGTH);
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn header_rejects_short_frame() {
        assert!(Header::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn proposal_key_survives_encoding() {
        let proposal = Proposal {
            key: "00ff".repeat(8),
            mutations: Some(Mutations {
                start_ts: 7,
                ..Default::default()
            }),
            ..Default::default()
        };
        let decoded = Proposal::decode(&proposal.encode().unwrap()).unwrap();
        assert_eq!(decoded.key, proposal.key);
        assert_eq!(decoded.mutations.unwrap().start_ts, 7);
    }

    #[test]
    fn schema_validation_rejects_bad_int() {
        let edge = Edge {
            entity: 1,
            attr: "age".into(),
            value: b"not-a-number".to_vec(),
            value_type: ValueType::Default,
            op: EdgeOp::Set,
        };
        let schema = SchemaUpdate {
            predicate: "age".into(),
            value_type: ValueType::Int,
            index: false,
        };
        assert!(validate_and_convert(&edge, &schema).is_err());
    }

    #[test]
    fn txn_tracks_indices_once() {
        let txn = Txn::new(10);
        txn.add_index(4);
        txn.add_index(4);
        txn.add_index(9);
        assert_eq!(txn.indices(), vec![4, 9]);
        assert!(!txn.should_abort());
        txn.set_abort();
        assert!(txn.should_abort());
    }
}
