//! Node, proposal, and apply machinery for one shard group.

mod apply;
mod error;
mod node;
mod proposals;
mod raft;
mod read_index;
mod scheduler;
mod snapshot;
mod types;
mod watermark;

pub use error::ReplicaError;
pub use node::{Node, ReplicaConfig};
pub use proposals::{ProposalCtx, Proposals};
pub use raft::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message, RaftBootstrap,
    RaftConfig, RaftEngine, RaftPeer, RaftStatus, Ready, ReadState, Snapshot, SnapshotMetadata,
    SoftState, StateRole, RAFT_NONE,
};
pub use types::{
    check_schema, validate_and_convert, ApplyContext, ClusterView, Edge, EdgeOp, Header, KvPair,
    LinRead, LogStorage, Member, MembershipState, Mutations, Oracle, Peer, PostingStore, Proposal,
    RaftContext, RaftTransport, RaftWal, RecoveredState, SchemaUpdate, Sequencing, Tablet, Txn,
    TxnContext, ValueType,
};
pub use watermark::WaterMark;
