//! Apply pipeline: single consumer over the committed-entry channel.
//!
//! The run loop emits `Applied.begin` for every committed index in strict
//! ascending order before an entry lands here, so this side only has to make
//! sure every index is eventually marked done. Decode failures and unknown
//! proposal facets are fatal: they mean the replicated log or the registry
//! has been corrupted, and continuing would diverge the group.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use super::node::Node;
use super::proposals::ProposalCtx;
use super::raft::{ConfChange, ConfChangeType, Entry, EntryType};
use super::types::{ApplyContext, KvPair, Proposal, RaftContext, TxnContext};

impl Node {
    pub(super) async fn process_apply_ch(self: Arc<Self>, mut apply_rx: mpsc::Receiver<Entry>) {
        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return,
                entry = apply_rx.recv() => match entry {
                    Some(entry) => self.apply_committed(entry).await,
                    None => return,
                },
            }
        }
    }

    async fn apply_committed(self: &Arc<Self>, entry: Entry) {
        if entry.data.is_empty() {
            // Raft no-op; never in the proposal map.
            self.applied.done(entry.index);
            return;
        }

        if entry.entry_type == EntryType::ConfChange {
            self.apply_conf_change(&entry);
            return;
        }
        assert!(entry.entry_type == EntryType::Normal, "unexpected entry type");

        let mut proposal = Proposal::decode(&entry.data).unwrap_or_else(|err| {
            panic!(
                "unable to decode proposal at index {}: {err:?}",
                entry.index
            )
        });
        if proposal.deprecated_id != 0 {
            proposal.key = proposal.deprecated_id.to_string();
        }

        if !self.props.has(&proposal.key) {
            // Replay after restart, or a replica that did not originate the
            // proposal. One final applied mark is emitted when the ref count
            // returns to zero.
            let (tx, _rx) = oneshot::channel();
            let pctx = ProposalCtx::new(tx, tracing::Span::none());
            assert!(
                self.props.store(&proposal.key, pctx),
                "found existing proposal with key {}",
                proposal.key
            );
        }
        self.props.set_index(&proposal.key, entry.index);

        self.txn_marks.begin(entry.index);
        if proposal.mutations.is_some() {
            // The txn mark for this index stays pending until the
            // transaction's commit or abort proposal resolves it.
            self.sch.schedule(self, &proposal, entry.index);
        } else if !proposal.kv.is_empty() {
            self.process_key_values(entry.index, &proposal.key, &proposal.kv)
                .await;
        } else if let Some(state) = proposal.state.take() {
            // Membership needn't be snapshotted by this group; a restart
            // fetches a state at least as new.
            self.cluster.apply_state(state);
            self.txn_marks.done(entry.index);
            self.props.done(&proposal.key, None);
        } else if !proposal.clean_predicate.is_empty() {
            self.delete_predicate(entry.index, &proposal.key, &proposal.clean_predicate)
                .await;
        } else if let Some(tctx) = proposal.txn_context.take() {
            let node = self.clone();
            let key = proposal.key.clone();
            tokio::spawn(async move {
                node.commit_or_abort(entry.index, &key, &tctx).await;
            });
        } else {
            panic!("unknown proposal at index {}", entry.index);
        }
    }

    /// Membership changes are applied inline, on followers straight from the
    /// run loop. Never in the proposal map.
    pub(super) fn apply_conf_change(&self, entry: &Entry) {
        let cc: ConfChange = bincode::deserialize(&entry.data)
            .unwrap_or_else(|err| panic!("unable to decode conf change: {err:?}"));

        if cc.change_type == ConfChangeType::RemoveNode {
            self.delete_peer(cc.node_id);
        } else if !cc.context.is_empty() {
            let rc = RaftContext::decode(&cc.context)
                .unwrap_or_else(|err| panic!("bad conf change context: {err:?}"));
            self.connect(rc.id, rc.addr);
        }

        let cs = self.raft().apply_conf_change(&cc);
        self.set_conf_state(cs);
        self.applied.done(entry.index);
        self.done_conf_change(cc.id, Ok(()));
        self.cluster.trigger_membership_sync();
    }

    async fn commit_or_abort(self: &Arc<Self>, index: u64, key: &str, tctx: &TxnContext) {
        let (span, _) = self.props.ctx_and_txn(key);

        if tctx.aborted || tctx.commit_ts == 0 {
            if let Some(txn) = self.oracle.lookup(tctx.start_ts) {
                txn.set_abort();
            }
        }

        let res = self.store.commit_or_abort(tctx).instrument(span).await;
        tracing::debug!(start_ts = tctx.start_ts, ok = res.is_ok(), "commit or abort");
        if res.is_ok() {
            if let Some(txn) = self.oracle.lookup(tctx.start_ts) {
                for idx in txn.indices() {
                    self.txn_marks.done(idx);
                }
            }
            self.oracle.done(tctx.start_ts);
        }
        self.txn_marks.done(index);
        self.props.done(key, res.err());
    }

    async fn delete_predicate(self: &Arc<Self>, index: u64, key: &str, predicate: &str) {
        let ctx = ApplyContext {
            group: self.gid(),
            index,
        };
        let res = self.store.delete_predicate(ctx, predicate).await;
        self.txn_marks.done(index);
        self.props.done(key, res.err());
    }

    async fn process_key_values(self: &Arc<Self>, index: u64, key: &str, kvs: &[KvPair]) {
        let res = self.store.ingest_key_values(kvs).await;
        self.txn_marks.done(index);
        self.props.done(key, res.err());
    }
}
