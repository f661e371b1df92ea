//! The per-group node: run loop and lifecycle.
//!
//! One `Node` exists per (process, group). The run loop is the sole driver of
//! the Raft engine: it ticks the logical clock, and for every `Ready` batch
//! persists entries, hard state, and snapshots before forwarding committed
//! entries to the apply pipeline and advancing the engine. Leaders send
//! outgoing messages in parallel with their own disk writes; followers only
//! after their state is durable, since acknowledging an append before local
//! durability could let the leader commit an entry this node then loses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::ReplicaError;
use super::proposals::{unique_key, ProposalCtx, Proposals};
use super::raft::{
    ConfChange, ConfState, Entry, EntryType, Message, RaftBootstrap, RaftConfig, RaftEngine,
    RaftPeer, Ready, StateRole,
};
use super::read_index::LinReadReq;
use super::scheduler::Scheduler;
use super::types::{
    check_schema, validate_and_convert, ClusterView, LogStorage, Oracle, Peer, PostingStore,
    Proposal, RaftContext, RaftTransport, RaftWal,
};
use super::watermark::WaterMark;

/// Replay progress is logged when a restart has this many entries to chew
/// through, every `REPLAY_LOG_EVERY` entries.
const REPLAY_LOG_THRESHOLD: usize = 100_000;
const REPLAY_LOG_EVERY: usize = 5_000;

/// Outbound messages batched per destination before each transport call.
const SEND_BATCH_MAX: usize = 128;

#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    pub id: u64,
    pub group: u32,
    pub addr: String,
    /// Process-wide bound on concurrently admitted proposals.
    pub pending_proposals: usize,
    pub tick_interval: Duration,
    pub snapshot_interval: Duration,
    /// Log tail kept behind periodic snapshots so followers catch up from
    /// the log instead of a full snapshot.
    pub snapshot_skip: u64,
    /// Applied-vs-txn watermark gap beyond which stale transactions are
    /// reaped via group zero.
    pub force_abort_difference: u64,
    pub propose_timeout: Duration,
    pub read_index_timeout: Duration,
    pub retry_pause: Duration,
    pub leadership_handoff_wait: Duration,
}

impl ReplicaConfig {
    pub fn new(id: u64, group: u32, addr: impl Into<String>) -> Self {
        Self {
            id,
            group,
            addr: addr.into(),
            pending_proposals: 256,
            tick_interval: Duration::from_millis(20),
            snapshot_interval: Duration::from_secs(30),
            snapshot_skip: 10,
            force_abort_difference: 5_000,
            propose_timeout: Duration::from_secs(600),
            read_index_timeout: Duration::from_secs(10),
            retry_pause: Duration::from_secs(1),
            leadership_handoff_wait: Duration::from_secs(1),
        }
    }
}

pub struct Node {
    pub(super) config: ReplicaConfig,
    raft_ctx: RaftContext,
    /// Marshaled `raft_ctx`, stamped into every outgoing message context.
    rc_bytes: Vec<u8>,

    pub(super) props: Proposals,
    pub(super) applied: Arc<WaterMark>,
    pub(super) txn_marks: Arc<WaterMark>,
    pub(super) sch: Scheduler,

    engine: RwLock<Option<Arc<dyn RaftEngine>>>,
    pub(super) store: Arc<dyn PostingStore>,
    pub(super) oracle: Arc<dyn Oracle>,
    pub(super) cluster: Arc<dyn ClusterView>,
    transport: Arc<dyn RaftTransport>,
    pub(super) wal: Arc<dyn RaftWal>,
    pub(super) log: Arc<dyn LogStorage>,

    /// Connected peer addresses, maintained by conf changes and snapshot
    /// ConfState restore.
    peers: RwLock<HashMap<u64, String>>,
    conf_state: RwLock<ConfState>,
    pending_conf: Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<()>>>>,

    pending_proposals: Semaphore,
    /// Not re-entrant; shared by proposal keys and ReadIndex tokens.
    pub(super) rng: Mutex<StdRng>,

    apply_tx: mpsc::Sender<Entry>,
    apply_rx: Mutex<Option<mpsc::Receiver<Entry>>>,
    pub(super) request_tx: mpsc::Sender<LinReadReq>,
    request_rx: Mutex<Option<mpsc::Receiver<LinReadReq>>>,
    msg_tx: mpsc::UnboundedSender<Message>,
    msg_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,

    can_campaign: AtomicBool,
    stop_token: CancellationToken,
    pub(super) closer: CancellationToken,
    tracker: TaskTracker,
    done_tx: watch::Sender<bool>,
}

impl Node {
    pub fn new(
        config: ReplicaConfig,
        store: Arc<dyn PostingStore>,
        oracle: Arc<dyn Oracle>,
        cluster: Arc<dyn ClusterView>,
        transport: Arc<dyn RaftTransport>,
        wal: Arc<dyn RaftWal>,
        log: Arc<dyn LogStorage>,
    ) -> Arc<Self> {
        tracing::info!(id = config.id, group = config.group, "node starting");

        let raft_ctx = RaftContext {
            id: config.id,
            group: config.group,
            addr: config.addr.clone(),
        };
        let rc_bytes = raft_ctx.encode().expect("raft context is encodable");

        let applied = Arc::new(WaterMark::new("applied"));
        let txn_marks = Arc::new(WaterMark::new("txn"));

        // Conf changes and the like are not throttled by admission, so leave
        // headroom beyond the proposal bound to keep ticks from blocking on a
        // full apply channel.
        let (apply_tx, apply_rx) = mpsc::channel(config.pending_proposals + 1000);
        let (request_tx, request_rx) = mpsc::channel(256);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (done_tx, _) = watch::channel(false);

        Arc::new(Self {
            props: Proposals::new(applied.clone()),
            applied,
            txn_marks,
            sch: Scheduler::default(),
            engine: RwLock::new(None),
            store,
            oracle,
            cluster,
            transport,
            wal,
            log,
            peers: RwLock::new(HashMap::new()),
            conf_state: RwLock::new(ConfState::default()),
            pending_conf: Mutex::new(HashMap::new()),
            pending_proposals: Semaphore::new(config.pending_proposals),
            rng: Mutex::new(StdRng::from_entropy()),
            apply_tx,
            apply_rx: Mutex::new(Some(apply_rx)),
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            msg_tx,
            msg_rx: Mutex::new(Some(msg_rx)),
            can_campaign: AtomicBool::new(false),
            stop_token: CancellationToken::new(),
            closer: CancellationToken::new(),
            tracker: TaskTracker::new(),
            done_tx,
            raft_ctx,
            rc_bytes,
            config,
        })
    }

    pub fn id(&self) -> u64 {
        self.config.id
    }

    /// Applied watermark: highest contiguously applied log index.
    pub fn applied(&self) -> &WaterMark {
        &self.applied
    }

    /// Txn watermark: highest index durably reflected in the txn index.
    pub fn txn_marks(&self) -> &WaterMark {
        &self.txn_marks
    }

    pub(super) fn gid(&self) -> u32 {
        self.config.group
    }

    pub(super) fn raft_context(&self) -> &RaftContext {
        &self.raft_ctx
    }

    pub(super) fn raft(&self) -> Arc<dyn RaftEngine> {
        self.try_raft().expect("raft engine is not initialized")
    }

    pub(super) fn try_raft(&self) -> Option<Arc<dyn RaftEngine>> {
        self.engine.read().expect("engine lock").clone()
    }

    fn set_raft(&self, engine: Arc<dyn RaftEngine>) {
        *self.engine.write().expect("engine lock") = Some(engine);
    }

    pub fn am_leader(&self) -> bool {
        let Some(engine) = self.try_raft() else {
            return false;
        };
        let status = engine.status();
        status.lead == status.id
    }

    pub(super) fn connect(&self, id: u64, addr: String) {
        if id == self.id() {
            return;
        }
        self.peers.write().expect("peers lock").insert(id, addr);
    }

    pub(super) fn delete_peer(&self, id: u64) {
        self.peers.write().expect("peers lock").remove(&id);
    }

    fn peer_addr(&self, id: u64) -> Option<String> {
        if let Some(addr) = self.peers.read().expect("peers lock").get(&id) {
            return Some(addr.clone());
        }
        self.cluster
            .members(self.gid())
            .get(&id)
            .map(|member| member.addr.clone())
    }

    pub(super) fn conf_state(&self) -> ConfState {
        self.conf_state.read().expect("conf state lock").clone()
    }

    pub(super) fn set_conf_state(&self, cs: ConfState) {
        *self.conf_state.write().expect("conf state lock") = cs;
    }

    pub(super) fn done_conf_change(&self, id: u64, result: anyhow::Result<()>) {
        let waiter = self.pending_conf.lock().expect("pending conf lock").remove(&id);
        if let Some(tx) = waiter {
            let _ = tx.send(result);
        }
    }

    /// Propose a membership change and wait for it to apply.
    pub async fn propose_conf_change(&self, cc: ConfChange) -> anyhow::Result<()> {
        let Some(engine) = self.try_raft() else {
            return Err(ReplicaError::RaftNotInitialized.into());
        };
        let (tx, rx) = oneshot::channel();
        self.pending_conf
            .lock()
            .expect("pending conf lock")
            .insert(cc.id, tx);
        let id = cc.id;

        let deadline = tokio::time::Instant::now() + self.config.propose_timeout;
        let proposed = tokio::time::timeout_at(deadline, engine.propose_conf_change(cc)).await;
        match proposed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.pending_conf.lock().expect("pending conf lock").remove(&id);
                return Err(err).context("while proposing conf change");
            }
            Err(_) => {
                self.pending_conf.lock().expect("pending conf lock").remove(&id);
                return Err(ReplicaError::ProposalTimeout.into());
            }
        }
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReplicaError::Stopped.into()),
            Err(_) => {
                self.pending_conf.lock().expect("pending conf lock").remove(&id);
                Err(ReplicaError::ProposalTimeout.into())
            }
        }
    }

    /// Send a proposal through Raft and wait for it to be applied on this
    /// node. The returned error is the proposal's final result: admission
    /// failures surface before consensus, apply errors after it.
    pub async fn propose_and_wait(&self, proposal: Proposal) -> anyhow::Result<()> {
        let Some(engine) = self.try_raft() else {
            return Err(ReplicaError::RaftNotInitialized.into());
        };
        let _permit = self
            .pending_proposals
            .acquire()
            .await
            .map_err(|_| ReplicaError::Stopped)?;

        // Best-effort admission checks. Invalid entries that slip past a
        // racing schema change are re-checked at apply time.
        if let Some(mutations) = &proposal.mutations {
            for edge in &mutations.edges {
                match self.cluster.tablet(&edge.attr) {
                    Some(tablet) if tablet.read_only => {
                        return Err(ReplicaError::PredicateMoving.into());
                    }
                    // The tablet can move by the time the request gets here.
                    Some(tablet) if tablet.group_id != self.gid() => {
                        return Err(ReplicaError::UnservedTablet.into());
                    }
                    None => return Err(ReplicaError::UnservedTablet.into()),
                    Some(_) => {}
                }
                if let Some(schema) = self.store.schema(&edge.attr) {
                    validate_and_convert(edge, &schema)?;
                }
            }
            for update in &mutations.schema {
                if let Some(tablet) = self.cluster.tablet(&update.predicate) {
                    if tablet.read_only {
                        return Err(ReplicaError::PredicateMoving.into());
                    }
                }
                check_schema(update)?;
            }
        }

        let (tx, rx) = oneshot::channel();
        let pctx = ProposalCtx::new(tx, tracing::Span::current());
        let key = unique_key(self.id(), &self.rng);
        assert!(
            self.props.store(&key, pctx),
            "found existing proposal with key {key}"
        );

        let mut proposal = proposal;
        proposal.key = key.clone();
        let data = proposal.encode()?;

        // A leader change can strand a proposal: a forwarded MsgProp can be
        // dropped, or surface as an empty committed entry. The deadline keeps
        // the client from waiting forever when it brought no timeout.
        let deadline = tokio::time::Instant::now() + self.config.propose_timeout;
        match tokio::time::timeout_at(deadline, engine.propose(data)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // Never entered the log; safe to drop from the registry.
                self.props.forget(&key);
                return Err(err).context("while proposing");
            }
            Err(_) => return Err(ReplicaError::ProposalTimeout.into()),
        }

        tracing::debug!(key = %key, "waiting for the proposal");
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReplicaError::Stopped.into()),
            // The entry may still commit; the registry entry stays so replay
            // accounting and the applied mark remain correct.
            Err(_) => Err(ReplicaError::ProposalTimeout.into()),
        }
    }

    pub(super) fn send_message(&self, msg: Message) {
        // Dropped messages are safe: Raft retries via its own timers.
        let _ = self.msg_tx.send(msg);
    }

    /// Drain outgoing messages, batch them per destination, and hand each
    /// batch to the transport off the run loop.
    pub(super) async fn batch_and_send_messages(
        self: Arc<Self>,
        mut msg_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        loop {
            let first = tokio::select! {
                _ = self.closer.cancelled() => return,
                msg = msg_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            };

            let mut by_dest: HashMap<u64, Vec<Message>> = HashMap::new();
            by_dest.entry(first.to).or_default().push(first);
            let mut drained = 1;
            while drained < SEND_BATCH_MAX {
                match msg_rx.try_recv() {
                    Ok(msg) => {
                        by_dest.entry(msg.to).or_default().push(msg);
                        drained += 1;
                    }
                    Err(_) => break,
                }
            }

            for (to, batch) in by_dest {
                let Some(addr) = self.peer_addr(to) else {
                    tracing::warn!(to, "no address for peer, dropping messages");
                    continue;
                };
                let transport = self.transport.clone();
                let peer = Peer { id: to, addr };
                tokio::spawn(async move {
                    if let Err(err) = transport.send(peer, batch).await {
                        tracing::debug!(to, error = ?err, "message send failed");
                    }
                });
            }
        }
    }

    /// Drive the Raft engine: the only task that ticks, persists, and
    /// advances it.
    pub(super) async fn run(
        self: Arc<Self>,
        mut ready_rx: mpsc::Receiver<Ready>,
        request_rx: mpsc::Receiver<LinReadReq>,
    ) {
        let mut first_run = true;
        let mut leader = false;
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Capacity 2: the read index loop never blocks without selecting on
        // this channel, so sends below rarely wait.
        let (read_state_tx, read_state_rx) = mpsc::channel(2);
        self.tracker.spawn(self.clone().snapshot_periodically());
        self.tracker
            .spawn(self.clone().run_read_index_loop(read_state_rx, request_rx));

        loop {
            tokio::select! {
                _ = ticker.tick() => self.raft().tick(),

                ready = ready_rx.recv() => {
                    let Some(mut rd) = ready else {
                        // Engine went away underneath us; still release the
                        // background loops and the done flag.
                        self.finish_shutdown().await;
                        return;
                    };

                    for rs in rd.read_states.drain(..) {
                        // Fails only once the read index loop has shut down.
                        let _ = read_state_tx.send(rs).await;
                    }

                    if let Some(ss) = rd.soft_state {
                        self.cluster.trigger_membership_sync();
                        leader = ss.raft_state == StateRole::Leader;
                    }

                    let mut messages = std::mem::take(&mut rd.messages);
                    for msg in &mut messages {
                        msg.context = self.rc_bytes.clone();
                    }
                    if leader {
                        // A leader may send in parallel with its own disk
                        // writes: followers reject the append until their own
                        // durability holds.
                        for msg in messages.drain(..) {
                            self.send_message(msg);
                        }
                    }

                    // Entries first, then hard state and snapshot.
                    if let Err(err) = self.wal.store(self.gid(), rd.hard_state, &rd.entries) {
                        panic!("wal store failed: {err:?}");
                    }
                    if let Err(err) = self.log.append(rd.hard_state, &rd.entries) {
                        panic!("log append failed: {err:?}");
                    }

                    if !rd.snapshot.is_empty() {
                        self.install_snapshot(&rd).await;
                    }

                    let count = rd.committed_entries.len();
                    if count > REPLAY_LOG_THRESHOLD {
                        tracing::info!(count, "replaying committed entries");
                    }
                    for (idx, entry) in rd.committed_entries.drain(..).enumerate() {
                        // Applied marks must start in index order: beginning 4
                        // before 3 would let done_until jump the gap.
                        self.applied.begin(entry.index);

                        if !leader && entry.entry_type == EntryType::ConfChange {
                            // Config changes in followers must be applied
                            // straight away, not queued.
                            self.apply_conf_change(&entry);
                        } else if self.apply_tx.send(entry).await.is_err() {
                            self.finish_shutdown().await;
                            return;
                        }

                        if count > REPLAY_LOG_THRESHOLD && idx % REPLAY_LOG_EVERY == 0 {
                            tracing::info!(idx, pending = count - idx, "replay progress");
                        }
                    }

                    if !leader {
                        // Followers must not acknowledge before durability.
                        for msg in messages.drain(..) {
                            self.send_message(msg);
                        }
                    }

                    self.raft().advance();

                    if first_run && self.can_campaign.load(Ordering::Acquire) {
                        let engine = self.raft();
                        tokio::spawn(async move {
                            if let Err(err) = engine.campaign().await {
                                tracing::warn!(error = ?err, "campaign failed");
                            }
                        });
                        first_run = false;
                    }
                }

                _ = self.stop_token.cancelled() => {
                    self.drain_and_stop().await;
                    return;
                }
            }
        }
    }

    /// A snapshot in a `Ready` means either the leader is bringing this node
    /// up to state, or it is one this node authored. Only the former is
    /// installed; both are persisted.
    async fn install_snapshot(&self, rd: &Ready) {
        let rc = RaftContext::decode(&rd.snapshot.data)
            .unwrap_or_else(|err| panic!("bad snapshot context: {err:?}"));
        assert!(rc.group == self.gid(), "snapshot from foreign group");

        if rc.id != self.id() {
            tracing::info!(group = self.gid(), from = rc.id, "retrieving snapshot");
            // Blocking tick processing here is fine: only followers install.
            let res = self
                .retry_until_success(|| self.retrieve_snapshot(), Duration::from_millis(100))
                .await;
            if res.is_err() {
                // Shutdown raced the install; the WAL snapshot below still
                // lets a restart resume from the leader.
                return;
            }
            tracing::info!(group = self.gid(), "snapshot retrieved");
        } else {
            tracing::info!(group = self.gid(), "ignoring self-authored snapshot");
        }

        if let Err(err) = self.wal.store_snapshot(self.gid(), &rd.snapshot) {
            panic!("wal snapshot store failed: {err:?}");
        }
        if let Err(err) = self.log.apply_snapshot(rd.snapshot.clone()) {
            panic!("log snapshot apply failed: {err:?}");
        }
        self.set_conf_state(rd.snapshot.metadata.conf_state.clone());
    }

    async fn drain_and_stop(&self) {
        if let (Some(peer_id), true) = (self.cluster.my_peer(), self.am_leader()) {
            tracing::info!(to = peer_id, "transferring leadership before stop");
            self.raft().transfer_leadership(peer_id).await;
            // Best effort: give the transfer a moment to land, then stop
            // regardless.
            tokio::time::sleep(self.config.leadership_handoff_wait).await;
        }
        self.raft().stop();
        self.finish_shutdown().await;
    }

    async fn finish_shutdown(&self) {
        self.closer.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        // send_replace: the flag must stick even with no subscriber yet.
        self.done_tx.send_replace(true);
        tracing::info!(group = self.gid(), "node stopped");
    }

    /// Signal the run loop to stop and wait for the handover and background
    /// loops to finish. Subsequent calls observe the done flag and return.
    pub async fn stop(&self) {
        let mut done_rx = self.done_tx.subscribe();
        if *done_rx.borrow_and_update() {
            return;
        }
        self.stop_token.cancel();
        while !*done_rx.borrow_and_update() {
            if done_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub(super) async fn retry_until_success<F, Fut>(
        &self,
        mut op: F,
        pause: Duration,
    ) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(error = ?err, "retrying after error");
                }
            }
            tokio::select! {
                // The run loop itself retries in here during snapshot
                // install, so the stop signal must break the loop directly.
                _ = self.stop_token.cancelled() => return Err(ReplicaError::Stopped.into()),
                _ = self.closer.cancelled() => return Err(ReplicaError::Stopped.into()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn join_peers(&self) -> anyhow::Result<()> {
        let leader = self.leader_blocking().await?;
        tracing::info!(leader = %leader.addr, "calling join cluster via leader");
        self.cluster
            .join_cluster(&leader, self.raft_context())
            .await
            .context("error while joining cluster")?;
        tracing::info!("done with join cluster call");
        Ok(())
    }

    /// Ask the group leader whether this node is already a member.
    async fn is_member(&self) -> anyhow::Result<bool> {
        let leader = self.leader_blocking().await?;
        self.cluster
            .is_peer(&leader, self.raft_context())
            .await
            .context("error while checking membership")
    }

    /// Recover the WAL, pick the startup mode, start the engine, and spawn
    /// the background loops. Called once, after at least one membership sync.
    pub async fn init_and_start(
        self: &Arc<Self>,
        bootstrap: &dyn RaftBootstrap,
    ) -> anyhow::Result<()> {
        let recovered = self.wal.recover(self.gid()).context("wal recovery")?;
        let mut restart = recovered.restart;

        self.applied.set_done_until(recovered.last_index);
        self.txn_marks.set_done_until(recovered.last_index);

        if let Some(snap) = &recovered.snapshot {
            self.log.apply_snapshot(snap.clone())?;
            self.set_conf_state(snap.metadata.conf_state.clone());
        }
        let hard_state = (!recovered.hard_state.is_empty()).then_some(recovered.hard_state);
        self.log.append(hard_state, &recovered.entries)?;

        if !restart && self.cluster.my_peer().is_some() {
            // The node has peers but no local state: it may have crashed
            // after joining the cluster and before writing a snapshot. Treat
            // it as a restart if the leader says it is already a member.
            loop {
                match self.is_member().await {
                    Ok(member) => {
                        restart = member;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, "error while calling is_member, retrying");
                    }
                }
                tokio::select! {
                    _ = self.stop_token.cancelled() => return Err(ReplicaError::Stopped.into()),
                    _ = self.closer.cancelled() => return Err(ReplicaError::Stopped.into()),
                    _ = tokio::time::sleep(self.config.retry_pause) => {}
                }
            }
        }

        let cfg = RaftConfig {
            id: self.id(),
            group: self.gid(),
            applied: recovered.last_index,
        };

        let (engine, ready_rx) = if restart {
            tracing::info!(group = self.gid(), "restarting node");
            let snapshot = self.log.snapshot().context("unable to get existing snapshot")?;
            if !snapshot.is_empty() {
                let members = self.cluster.members(self.gid());
                for id in &snapshot.metadata.conf_state.nodes {
                    if let Some(member) = members.get(id) {
                        self.connect(*id, member.addr.clone());
                    }
                }
                self.set_conf_state(snapshot.metadata.conf_state.clone());
            }
            bootstrap.restart(cfg)
        } else if self.cluster.my_peer().is_some() {
            tracing::info!(group = self.gid(), "new node, joining existing group");
            // Fetch the snapshot before joining: retrieval can take a while,
            // and the quorum should not carry a silent member meanwhile.
            self.retry_until_success(|| self.retrieve_snapshot(), self.config.retry_pause)
                .await?;
            self.retry_until_success(|| self.join_peers(), self.config.retry_pause)
                .await?;
            bootstrap.start(cfg, Vec::new())
        } else {
            tracing::info!(group = self.gid(), "new single-node group");
            self.can_campaign.store(true, Ordering::Release);
            bootstrap.start(cfg, vec![RaftPeer { id: self.id() }])
        };
        self.set_raft(engine);

        let apply_rx = self
            .apply_rx
            .lock()
            .expect("apply receiver lock")
            .take()
            .expect("apply receiver already taken");
        let request_rx = self
            .request_rx
            .lock()
            .expect("request receiver lock")
            .take()
            .expect("request receiver already taken");
        let msg_rx = self
            .msg_rx
            .lock()
            .expect("message receiver lock")
            .take()
            .expect("message receiver already taken");

        self.tracker.spawn(self.clone().process_apply_ch(apply_rx));
        self.tracker
            .spawn(self.clone().batch_and_send_messages(msg_rx));
        tokio::spawn(self.clone().run(ready_rx, request_rx));
        Ok(())
    }
}
