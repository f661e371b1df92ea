//! Snapshot creation, log compaction, and snapshot retrieval.
//!
//! Snapshots are taken at the transactional watermark, never past it: indices
//! above `TxnMarks.done_until()` may belong to transactions whose commit
//! status is not yet durably indexed, and compacting them away would lose
//! in-flight data on replay. When open transactions hold the watermark back
//! far enough, the node asks group zero to abort the oldest of them.

use std::sync::Arc;

use anyhow::Context;

use super::error::ReplicaError;
use super::node::Node;
use super::types::Peer;

impl Node {
    pub(super) async fn snapshot_periodically(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.snapshot_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return,
                _ = ticker.tick() => {
                    // Large proposals pin memory until compacted, so snapshot
                    // as soon as enough of the log is transactionally done.
                    if let Err(err) = self.snapshot(self.config.snapshot_skip).await {
                        tracing::warn!(error = ?err, "periodic snapshot failed");
                    }
                }
            }
        }
    }

    /// Create a snapshot at `TxnMarks.done_until() - skip` and compact the
    /// log up to it. `skip` keeps a small tail of entries so slow followers
    /// can still catch up from the log; explicit requests pass zero.
    pub async fn snapshot(&self, skip: u64) -> anyhow::Result<()> {
        let txn_watermark = self.txn_marks.done_until();
        let existing = self
            .log
            .snapshot()
            .context("unable to get existing snapshot")?;

        let last_snapshot_idx = existing.metadata.index;
        if txn_watermark <= last_snapshot_idx + skip {
            let applied_watermark = self.applied.done_until();
            let gap = applied_watermark.saturating_sub(txn_watermark);
            let force_abort = self.config.force_abort_difference;
            if gap > force_abort * 3 / 2 && skip != 0 {
                if gap > force_abort * 3 {
                    // The abort path reaps the oldest 20% above 1.5x, so a
                    // 3x gap means aborts are not keeping up.
                    tracing::warn!(
                        txn_watermark,
                        applied_watermark,
                        "cannot take snapshot, transactions holding back the watermark"
                    );
                }
                self.abort_old_transactions(gap).await;
            }
            return Ok(());
        }

        let snapshot_idx = txn_watermark - skip;
        tracing::debug!(group = self.gid(), snapshot_idx, "taking snapshot");

        let rc_bytes = self.raft_context().encode()?;
        let snap = self
            .log
            .create_snapshot(snapshot_idx, self.conf_state(), rc_bytes)
            .context("while creating snapshot")?;
        self.log
            .compact(snapshot_idx)
            .context("while compacting log")?;
        tracing::info!(
            snapshot_idx,
            applied = self.applied.done_until(),
            "writing snapshot"
        );
        self.wal.store_snapshot(self.gid(), &snap)?;
        Ok(())
    }

    /// Ask group zero to abort transactions still open since the last
    /// snapshot. Best effort; the next periodic snapshot retries.
    pub(super) async fn abort_old_transactions(&self, pending: u64) {
        let start_timestamps = self.oracle.txns_since_snapshot(pending);
        if start_timestamps.is_empty() {
            return;
        }
        tracing::info!(
            count = start_timestamps.len(),
            "requesting abort of stale transactions"
        );
        if let Err(err) = self.cluster.try_abort(start_timestamps).await {
            tracing::warn!(error = ?err, "try abort failed");
        }
    }

    /// Stream this group's data from its leader, replacing local state.
    /// Called on join and on follower snapshot install.
    pub(super) async fn retrieve_snapshot(&self) -> anyhow::Result<()> {
        let leader = self.leader_blocking().await?;

        // populate_shard writes directly to the store; wait for in-flight
        // applies to land first or they could overwrite streamed values.
        self.apply_all_marks().await;

        // Cached posting lists may predate the snapshot when its index is
        // ahead of this node's log.
        self.store.evict_cache();
        self.store
            .populate_shard(&leader)
            .await
            .context("cannot retrieve snapshot from peer")?;

        // The stream lands schema rows straight in the store as well.
        self.store
            .load_schema()
            .await
            .context("while reloading schema")?;
        self.cluster.trigger_membership_sync();
        Ok(())
    }

    pub(super) async fn apply_all_marks(&self) {
        let last_index = self.applied.last_index();
        self.applied.wait_for_mark(last_index).await;
    }

    /// Locate this group's leader, refreshing membership from group zero when
    /// it is unknown. Callers retry.
    pub(super) async fn leader_blocking(&self) -> anyhow::Result<Peer> {
        if let Some(leader) = self.cluster.leader(self.gid()) {
            return Ok(leader);
        }
        // Leader election may not have happened yet at initial start; pull
        // the latest state from zero before the caller retries.
        self.cluster
            .update_membership_state()
            .await
            .context("while trying to update membership state")?;
        Err(ReplicaError::NoLeader.into())
    }
}
