//! Linearizable read coordination.
//!
//! One ReadIndex request is outstanding at a time. Requests arriving while it
//! is in flight are coalesced and answered with the same index; a timed-out
//! or failed request answers every waiter with [`RAFT_NONE`]. A successful
//! read then gates on the applied watermark reaching the returned index.

use std::sync::Arc;

use rand::RngCore;
use tokio::sync::{mpsc, oneshot};

use super::error::ReplicaError;
use super::node::Node;
use super::raft::{ReadState, RAFT_NONE};
use super::types::{LinRead, Sequencing};

pub(super) struct LinReadReq {
    /// One-shot channel a Raft index is sent on.
    index_tx: oneshot::Sender<u64>,
}

impl Node {
    /// Submit a linearizable-read request; the returned channel yields the
    /// commit index to wait for, or [`RAFT_NONE`] on failure.
    pub(super) async fn read_index(&self) -> anyhow::Result<oneshot::Receiver<u64>> {
        let (index_tx, index_rx) = oneshot::channel();
        self.request_tx
            .send(LinReadReq { index_tx })
            .await
            .map_err(|_| ReplicaError::Stopped)?;
        Ok(index_rx)
    }

    pub(super) async fn run_read_index_loop(
        self: Arc<Self>,
        mut read_state_rx: mpsc::Receiver<ReadState>,
        mut request_rx: mpsc::Receiver<LinReadReq>,
    ) {
        let mut requests: Vec<LinReadReq> = Vec::new();
        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return,
                // No pending request: stray ReadStates are discarded.
                Some(_) = read_state_rx.recv() => {}
                req = request_rx.recv() => {
                    let Some(req) = req else { return };
                    requests.push(req);
                    // Coalesce the burst behind this request.
                    while let Ok(req) = request_rx.try_recv() {
                        requests.push(req);
                    }

                    let mut active_rctx = [0u8; 8];
                    self.rng.lock().expect("key rng lock").fill_bytes(&mut active_rctx);
                    self.answer_batch(&mut requests, active_rctx, &mut read_state_rx).await;
                    requests.clear();
                }
            }
        }
    }

    /// Issue one ReadIndex and answer every queued requestor from it.
    async fn answer_batch(
        &self,
        requests: &mut Vec<LinReadReq>,
        active_rctx: [u8; 8],
        read_state_rx: &mut mpsc::Receiver<ReadState>,
    ) {
        // The deadline is detached from any client: waiters that give up
        // unsubscribe by dropping their receiver, they do not cancel the
        // outstanding ReadIndex.
        let deadline = tokio::time::Instant::now() + self.config.read_index_timeout;

        let issued = tokio::time::timeout_at(deadline, self.raft().read_index(active_rctx.to_vec()))
            .await;
        match issued {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(error = ?err, "read index request failed");
                reply_all(requests, RAFT_NONE);
                return;
            }
            Err(_) => {
                reply_all(requests, RAFT_NONE);
                return;
            }
        }

        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return,
                rs = read_state_rx.recv() => {
                    let Some(rs) = rs else { return };
                    if rs.request_ctx != active_rctx {
                        // A ReadState from an earlier, abandoned request.
                        continue;
                    }
                    reply_all(requests, rs.index);
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    reply_all(requests, RAFT_NONE);
                    return;
                }
            }
        }
    }

    /// Block until a read at this moment would observe every write committed
    /// before it. Returns [`ReplicaError::ReadIndex`] when no index could be
    /// obtained.
    pub async fn wait_linearizable_read(&self) -> anyhow::Result<()> {
        let index_rx = self.read_index().await?;
        let index = index_rx.await.map_err(|_| ReplicaError::Stopped)?;
        if index == RAFT_NONE {
            return Err(ReplicaError::ReadIndex.into());
        }
        self.applied.wait_for_mark(index).await;
        Ok(())
    }

    /// Honor a client's read-sequencing demand before serving a query.
    pub async fn wait_for_min_proposal(&self, read: Option<&LinRead>) -> anyhow::Result<()> {
        let Some(read) = read else {
            return Ok(());
        };
        if read.sequencing == Sequencing::ServerSide {
            return self.wait_linearizable_read().await;
        }
        if read.ids.is_empty() {
            return Ok(());
        }
        let min = read.ids.get(&self.gid()).copied().unwrap_or(0);
        self.applied.wait_for_mark(min).await;
        Ok(())
    }
}

fn reply_all(requests: &mut Vec<LinReadReq>, index: u64) {
    for req in requests.drain(..) {
        // The waiter may have given up; nothing to do then.
        let _ = req.index_tx.send(index);
    }
}
