//! In-flight proposal registry.
//!
//! Every client proposal (and every committed entry replayed on a follower)
//! is tracked here under its 16-byte key. The scheduler fans one proposal out
//! into many tasks; the registry ref-counts them and signals the completion
//! channel exactly once, when the count returns to zero. The applied
//! watermark for the proposal's index is emitted at that same moment, so the
//! contiguous-prefix invariant holds even when subtasks finish out of order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use rand::rngs::StdRng;
use rand::RngCore;
use tokio::sync::oneshot;

use super::types::Txn;
use super::watermark::WaterMark;

/// Handle for one proposal while it is in flight.
pub struct ProposalCtx {
    /// Single-shot completion channel; `Err` carries the first subtask error.
    ch: Option<oneshot::Sender<anyhow::Result<()>>>,
    /// Span of the originating request, entered by apply-side tasks.
    span: tracing::Span,
    cnt: i64,
    err: Option<anyhow::Error>,
    /// Raft index the proposal committed at; zero until seen by apply.
    pub index: u64,
    txn: Option<Arc<Txn>>,
}

impl ProposalCtx {
    pub fn new(ch: oneshot::Sender<anyhow::Result<()>>, span: tracing::Span) -> Self {
        Self {
            ch: Some(ch),
            span,
            cnt: 1,
            err: None,
            index: 0,
            txn: None,
        }
    }
}

/// Registry of in-flight proposals, keyed by the in-log proposal key.
pub struct Proposals {
    ids: RwLock<HashMap<String, ProposalCtx>>,
    applied: Arc<WaterMark>,
}

impl Proposals {
    pub fn new(applied: Arc<WaterMark>) -> Self {
        Self {
            ids: RwLock::new(HashMap::new()),
            applied,
        }
    }

    /// Insert if absent; false when the key is already live. A duplicate key
    /// for a client proposal is an invariant violation the caller must treat
    /// as fatal.
    pub fn store(&self, key: &str, pctx: ProposalCtx) -> bool {
        let mut ids = self.ids.write().expect("proposals lock");
        if ids.contains_key(key) {
            return false;
        }
        ids.insert(key.to_owned(), pctx);
        true
    }

    pub fn has(&self, key: &str) -> bool {
        self.ids.read().expect("proposals lock").contains_key(key)
    }

    /// Add `count` fan-out references. The key must be live.
    pub fn inc_ref(&self, key: &str, count: i64) {
        let mut ids = self.ids.write().expect("proposals lock");
        let pctx = ids.get_mut(key).expect("inc_ref on unknown proposal");
        pctx.cnt += count;
    }

    /// Record the Raft index the proposal committed at.
    pub fn set_index(&self, key: &str, index: u64) {
        let mut ids = self.ids.write().expect("proposals lock");
        let pctx = ids.get_mut(key).expect("set_index on unknown proposal");
        pctx.index = index;
    }

    /// Attach the posting-store transaction mutations apply through.
    pub fn attach_txn(&self, key: &str, txn: Arc<Txn>) {
        let mut ids = self.ids.write().expect("proposals lock");
        let pctx = ids.get_mut(key).expect("attach_txn on unknown proposal");
        pctx.txn = Some(txn);
    }

    /// Tracing span and transaction for a live proposal. The key must exist:
    /// tasks only run after the apply pipeline registered the proposal.
    pub fn ctx_and_txn(&self, key: &str) -> (tracing::Span, Option<Arc<Txn>>) {
        let ids = self.ids.read().expect("proposals lock");
        let pctx = ids.get(key).expect("ctx_and_txn on unknown proposal");
        (pctx.span.clone(), pctx.txn.clone())
    }

    /// Drop a proposal that never reached the apply pipeline (propose error
    /// or commit timeout). The completion channel is not signaled.
    pub fn forget(&self, key: &str) {
        self.ids.write().expect("proposals lock").remove(key);
    }

    /// Release one reference. A missing key returns silently, which tolerates
    /// a duplicate done after replay-only proposals. When the count reaches
    /// zero the entry is removed, the completion channel signaled with the
    /// first recorded error, and the applied watermark marked done.
    pub fn done(&self, key: &str, err: Option<anyhow::Error>) {
        let finished = {
            let mut ids = self.ids.write().expect("proposals lock");
            let Some(pctx) = ids.get_mut(key) else {
                return;
            };
            assert!(
                pctx.cnt > 0 && pctx.index != 0,
                "proposal {key} completed without a live ref and committed index"
            );
            pctx.cnt -= 1;
            if let Some(err) = err {
                pctx.err.get_or_insert(err);
            }
            if pctx.cnt > 0 {
                return;
            }
            ids.remove(key).expect("proposal vanished under write lock")
        };

        // Mark applied before unblocking the client, so a caller that reads
        // the watermark right after completion sees its own proposal.
        self.applied.done(finished.index);

        let result = match finished.err {
            Some(err) => Err(err),
            None => Ok(()),
        };
        if let Some(ch) = finished.ch {
            // The receiver may have timed out and gone away.
            let _ = ch.send(result);
        }
    }
}

/// 16-byte proposal key: this node's Raft id in the low 8 bytes, then 8 bytes
/// of cryptographic-quality randomness, hex encoded. Unique across replicas
/// with very high probability; a collision is rejected by `store` and fatal.
pub(super) fn unique_key(raft_id: u64, rng: &Mutex<StdRng>) -> String {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&raft_id.to_le_bytes());
    rng.lock().expect("key rng lock").fill_bytes(&mut buf[8..]);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn registry() -> (Arc<WaterMark>, Proposals) {
        let applied = Arc::new(WaterMark::new("applied"));
        let props = Proposals::new(applied.clone());
        (applied, props)
    }

    fn pctx() -> (ProposalCtx, oneshot::Receiver<anyhow::Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (ProposalCtx::new(tx, tracing::Span::none()), rx)
    }

    #[test]
    fn duplicate_store_is_rejected() {
        let (_, props) = registry();
        let (ctx, _rx) = pctx();
        assert!(props.store("k1", ctx));
        let (ctx, _rx2) = pctx();
        assert!(!props.store("k1", ctx));
    }

    #[test]
    fn completion_fires_once_when_refs_drain() {
        let (applied, props) = registry();
        applied.begin(3);

        let (ctx, mut rx) = pctx();
        assert!(props.store("k1", ctx));
        props.set_index("k1", 3);
        props.inc_ref("k1", 2);

        props.done("k1", None);
        props.done("k1", None);
        assert!(rx.try_recv().is_err(), "completion before refs drained");
        assert_eq!(applied.done_until(), 0);

        props.done("k1", None);
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(applied.done_until(), 3);
        assert!(!props.has("k1"));
    }

    #[test]
    fn first_error_wins() {
        let (applied, props) = registry();
        applied.begin(1);

        let (ctx, mut rx) = pctx();
        props.store("k1", ctx);
        props.set_index("k1", 1);
        props.inc_ref("k1", 1);

        props.done("k1", Some(anyhow::anyhow!("first")));
        props.done("k1", Some(anyhow::anyhow!("second")));

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[test]
    fn done_on_missing_key_is_silent() {
        let (_, props) = registry();
        props.done("missing", None);
    }

    #[test]
    fn unique_key_embeds_node_identity() {
        let rng = Mutex::new(StdRng::seed_from_u64(42));
        let key = unique_key(0x0102_0304, &rng);
        assert_eq!(key.len(), 32);
        assert!(key.starts_with("04030201"));
        assert_ne!(key, unique_key(0x0102_0304, &rng));
    }
}
