use thiserror::Error;

/// Sentinel errors the replication core matches on.
///
/// Everything else flows through `anyhow::Error`; these variants exist so the
/// scheduler, read path, and admission checks can branch on the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplicaError {
    /// The transaction was marked for abort before this mutation ran.
    #[error("transaction conflict, mutation aborted")]
    Conflict,
    /// ReadIndex timed out or no leader was configured.
    #[error("cannot serve linearizable read (time expired or no configured leader)")]
    ReadIndex,
    /// The predicate's tablet is read-only while it moves between groups.
    #[error("predicate is being moved, retry the mutation")]
    PredicateMoving,
    /// The predicate's tablet is not served by this group.
    #[error("predicate is not served by this group")]
    UnservedTablet,
    /// A proposal was submitted before the Raft engine was attached.
    #[error("raft engine is not initialized yet")]
    RaftNotInitialized,
    /// No leader could be located for the group.
    #[error("unable to reach leader for group")]
    NoLeader,
    /// The proposal did not commit within the propose deadline.
    #[error("timed out while waiting for proposal to commit")]
    ProposalTimeout,
    /// The node is shutting down.
    #[error("node is shutting down")]
    Stopped,
}
