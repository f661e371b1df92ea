//! End-to-end tests for the replica node, driven through a scriptable
//! consensus engine. The engine commits proposals instantly (single-node
//! quorum) unless a test switches it into a failure mode.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use plexus_raftwal::{FileWal, MemoryLog};
use plexus_replica::replica::{
    ClusterView, ConfChange, ConfChangeType, ConfState, Edge, EdgeOp, Entry, EntryType, HardState,
    KvPair, LinRead, LogStorage, Member, MembershipState, Message, Mutations, Node, Oracle, Peer,
    PostingStore, Proposal, RaftBootstrap, RaftConfig, RaftContext, RaftEngine, RaftPeer,
    RaftStatus, RaftTransport, RaftWal, ReadState, Ready, ReplicaConfig, ReplicaError, SchemaUpdate,
    Sequencing, Snapshot, SnapshotMetadata, StateRole, Tablet, Txn, TxnContext, ValueType,
};

const NODE_ID: u64 = 1;
const GROUP: u32 = 1;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ProposeMode {
    /// Commit every proposal immediately, like a healthy single-node group.
    Commit,
    /// Fail the propose call, like a node that lost leadership.
    Reject,
    /// Accept the proposal but never commit it.
    BlackHole,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Respond,
    /// Never answer, like a partitioned leader.
    Silent,
}

struct EngineInner {
    next_index: u64,
    term: u64,
    conf_nodes: Vec<u64>,
    ready_tx: Option<mpsc::Sender<Ready>>,
}

struct StubEngine {
    id: u64,
    inner: Mutex<EngineInner>,
    propose_mode: Mutex<ProposeMode>,
    read_mode: Mutex<ReadMode>,
    read_index_calls: AtomicUsize,
    transfers: Mutex<Vec<u64>>,
}

impl StubEngine {
    fn new(id: u64, applied: u64, ready_tx: mpsc::Sender<Ready>) -> Self {
        Self {
            id,
            inner: Mutex::new(EngineInner {
                next_index: applied + 1,
                term: 1,
                conf_nodes: vec![id],
                ready_tx: Some(ready_tx),
            }),
            propose_mode: Mutex::new(ProposeMode::Commit),
            read_mode: Mutex::new(ReadMode::Respond),
            read_index_calls: AtomicUsize::new(0),
            transfers: Mutex::new(Vec::new()),
        }
    }

    fn set_propose_mode(&self, mode: ProposeMode) {
        *self.propose_mode.lock().unwrap() = mode;
    }

    fn set_read_mode(&self, mode: ReadMode) {
        *self.read_mode.lock().unwrap() = mode;
    }

    fn read_index_calls(&self) -> usize {
        self.read_index_calls.load(Ordering::SeqCst)
    }

    fn ready_sender(&self) -> Option<mpsc::Sender<Ready>> {
        self.inner.lock().unwrap().ready_tx.clone()
    }

    /// Inject an arbitrary Ready batch, as the raft library would.
    async fn push_ready(&self, ready: Ready) {
        let tx = self.ready_sender().expect("engine stopped");
        tx.send(ready).await.expect("run loop gone");
    }

    async fn commit_entry(&self, entry_type: EntryType, data: Vec<u8>) -> anyhow::Result<u64> {
        let (tx, entry, hs) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(tx) = inner.ready_tx.clone() else {
                anyhow::bail!("engine stopped");
            };
            let entry = Entry {
                entry_type,
                term: inner.term,
                index: inner.next_index,
                data,
            };
            inner.next_index += 1;
            let hs = HardState {
                term: inner.term,
                vote: self.id,
                commit: entry.index,
            };
            (tx, entry, hs)
        };
        let index = entry.index;
        let ready = Ready {
            hard_state: Some(hs),
            entries: vec![entry.clone()],
            committed_entries: vec![entry],
            ..Ready::default()
        };
        tx.send(ready).await.map_err(|_| anyhow::anyhow!("run loop gone"))?;
        Ok(index)
    }
}

#[async_trait]
impl RaftEngine for StubEngine {
    fn tick(&self) {}

    async fn propose(&self, data: Vec<u8>) -> anyhow::Result<()> {
        let mode = *self.propose_mode.lock().unwrap();
        match mode {
            ProposeMode::Commit => {
                self.commit_entry(EntryType::Normal, data).await?;
                Ok(())
            }
            ProposeMode::Reject => anyhow::bail!("raft proposal dropped"),
            ProposeMode::BlackHole => Ok(()),
        }
    }

    async fn propose_conf_change(&self, cc: ConfChange) -> anyhow::Result<()> {
        let data = bincode::serialize(&cc).context("encode conf change")?;
        self.commit_entry(EntryType::ConfChange, data).await?;
        Ok(())
    }

    async fn read_index(&self, rctx: Vec<u8>) -> anyhow::Result<()> {
        self.read_index_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.read_mode.lock().unwrap();
        match mode {
            ReadMode::Respond => {
                let index = self.inner.lock().unwrap().next_index - 1;
                self.push_ready(Ready {
                    read_states: vec![ReadState {
                        index,
                        request_ctx: rctx,
                    }],
                    ..Ready::default()
                })
                .await;
                Ok(())
            }
            ReadMode::Silent => Ok(()),
        }
    }

    fn apply_conf_change(&self, cc: &ConfChange) -> ConfState {
        let mut inner = self.inner.lock().unwrap();
        match cc.change_type {
            ConfChangeType::AddNode => {
                if !inner.conf_nodes.contains(&cc.node_id) {
                    inner.conf_nodes.push(cc.node_id);
                }
            }
            ConfChangeType::RemoveNode => inner.conf_nodes.retain(|id| *id != cc.node_id),
        }
        ConfState {
            nodes: inner.conf_nodes.clone(),
        }
    }

    async fn campaign(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn transfer_leadership(&self, transferee: u64) {
        self.transfers.lock().unwrap().push(transferee);
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            lead: self.id,
            raft_state: StateRole::Leader,
        }
    }

    fn advance(&self) {}

    fn stop(&self) {
        self.inner.lock().unwrap().ready_tx = None;
    }
}

#[derive(Default)]
struct StubBootstrap {
    engine: Mutex<Option<Arc<StubEngine>>>,
}

impl StubBootstrap {
    fn engine(&self) -> Arc<StubEngine> {
        self.engine.lock().unwrap().clone().expect("node not started")
    }

    fn make(&self, cfg: RaftConfig) -> (Arc<dyn RaftEngine>, mpsc::Receiver<Ready>) {
        let (tx, rx) = mpsc::channel(64);
        let engine = Arc::new(StubEngine::new(cfg.id, cfg.applied, tx));
        *self.engine.lock().unwrap() = Some(engine.clone());
        (engine, rx)
    }
}

impl RaftBootstrap for StubBootstrap {
    fn restart(&self, cfg: RaftConfig) -> (Arc<dyn RaftEngine>, mpsc::Receiver<Ready>) {
        self.make(cfg)
    }

    fn start(
        &self,
        cfg: RaftConfig,
        _peers: Vec<RaftPeer>,
    ) -> (Arc<dyn RaftEngine>, mpsc::Receiver<Ready>) {
        self.make(cfg)
    }
}

#[derive(Default)]
struct StoreInner {
    /// (entity, predicate) -> value.
    values: HashMap<(u64, String), Vec<u8>>,
    /// (predicate, value) -> entities, the reverse index.
    reverse: HashMap<(String, Vec<u8>), HashSet<u64>>,
    schema: HashMap<String, SchemaUpdate>,
    kv: HashMap<Vec<u8>, Vec<u8>>,
    commits: Vec<TxnContext>,
}

#[derive(Default)]
struct MemStore {
    inner: Mutex<StoreInner>,
    evictions: AtomicUsize,
    populate_calls: AtomicUsize,
}

impl MemStore {
    fn value_of(&self, entity: u64, attr: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .values
            .get(&(entity, attr.to_owned()))
            .cloned()
    }

    fn reverse_lookup(&self, attr: &str, value: &[u8]) -> HashSet<u64> {
        self.inner
            .lock()
            .unwrap()
            .reverse
            .get(&(attr.to_owned(), value.to_vec()))
            .cloned()
            .unwrap_or_default()
    }

    fn commit_count(&self) -> usize {
        self.inner.lock().unwrap().commits.len()
    }
}

#[async_trait]
impl PostingStore for MemStore {
    async fn run_mutation(
        &self,
        _ctx: plexus_replica::replica::ApplyContext,
        edge: &Edge,
        _txn: &Txn,
    ) -> anyhow::Result<()> {
        // Yield so concurrent chains interleave if serialization is broken.
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock().unwrap();
        let key = (edge.entity, edge.attr.clone());
        match edge.op {
            EdgeOp::Set => {
                if let Some(old) = inner.values.get(&key).cloned() {
                    if let Some(set) = inner.reverse.get_mut(&(edge.attr.clone(), old)) {
                        set.remove(&edge.entity);
                    }
                }
                inner.values.insert(key, edge.value.clone());
                inner
                    .reverse
                    .entry((edge.attr.clone(), edge.value.clone()))
                    .or_default()
                    .insert(edge.entity);
            }
            EdgeOp::Delete => {
                if let Some(old) = inner.values.remove(&key) {
                    if let Some(set) = inner.reverse.get_mut(&(edge.attr.clone(), old)) {
                        set.remove(&edge.entity);
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_schema_mutation(
        &self,
        _ctx: plexus_replica::replica::ApplyContext,
        schema: &[SchemaUpdate],
        _start_ts: u64,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for update in schema {
            inner.schema.insert(update.predicate.clone(), update.clone());
        }
        Ok(())
    }

    async fn delete_predicate(
        &self,
        _ctx: plexus_replica::replica::ApplyContext,
        predicate: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.values.retain(|(_, attr), _| attr != predicate);
        inner.reverse.retain(|(attr, _), _| attr != predicate);
        Ok(())
    }

    async fn ingest_key_values(&self, kvs: &[KvPair]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for kv in kvs {
            inner.kv.insert(kv.key.clone(), kv.value.clone());
        }
        Ok(())
    }

    async fn commit_or_abort(&self, tctx: &TxnContext) -> anyhow::Result<()> {
        self.inner.lock().unwrap().commits.push(tctx.clone());
        Ok(())
    }

    fn evict_cache(&self) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }

    async fn populate_shard(&self, _leader: &Peer) -> anyhow::Result<usize> {
        self.populate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn load_schema(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn schema(&self, predicate: &str) -> Option<SchemaUpdate> {
        self.inner.lock().unwrap().schema.get(predicate).cloned()
    }
}

#[derive(Default)]
struct StubOracle {
    txns: Mutex<HashMap<u64, Arc<Txn>>>,
    waits: Mutex<Vec<u64>>,
    stale: Mutex<Vec<u64>>,
}

impl StubOracle {
    fn waits(&self) -> Vec<u64> {
        self.waits.lock().unwrap().clone()
    }

    fn set_stale_txns(&self, start_timestamps: Vec<u64>) {
        *self.stale.lock().unwrap() = start_timestamps;
    }
}

#[async_trait]
impl Oracle for StubOracle {
    fn register(&self, start_ts: u64) -> Arc<Txn> {
        self.txns
            .lock()
            .unwrap()
            .entry(start_ts)
            .or_insert_with(|| Arc::new(Txn::new(start_ts)))
            .clone()
    }

    fn lookup(&self, start_ts: u64) -> Option<Arc<Txn>> {
        self.txns.lock().unwrap().get(&start_ts).cloned()
    }

    async fn wait_for_ts(&self, start_ts: u64) {
        self.waits.lock().unwrap().push(start_ts);
    }

    fn done(&self, start_ts: u64) {
        self.txns.lock().unwrap().remove(&start_ts);
    }

    fn txns_since_snapshot(&self, _pending: u64) -> Vec<u64> {
        self.stale.lock().unwrap().clone()
    }
}

struct StubCluster {
    group: u32,
    leader: Mutex<Option<Peer>>,
    my_peer: Mutex<Option<u64>>,
    members: Mutex<HashMap<u64, Member>>,
    sync_count: AtomicUsize,
    applied_states: Mutex<Vec<MembershipState>>,
    aborts: Mutex<Vec<Vec<u64>>>,
}

impl StubCluster {
    fn new(group: u32) -> Self {
        Self {
            group,
            leader: Mutex::new(None),
            my_peer: Mutex::new(None),
            members: Mutex::new(HashMap::new()),
            sync_count: AtomicUsize::new(0),
            applied_states: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
        }
    }

    fn set_leader(&self, leader: Peer) {
        *self.leader.lock().unwrap() = Some(leader);
    }

    fn aborts(&self) -> Vec<Vec<u64>> {
        self.aborts.lock().unwrap().clone()
    }

    fn applied_state_count(&self) -> usize {
        self.applied_states.lock().unwrap().len()
    }

    fn sync_count(&self) -> usize {
        self.sync_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterView for StubCluster {
    fn group_id(&self) -> u32 {
        self.group
    }

    fn tablet(&self, predicate: &str) -> Option<Tablet> {
        Some(Tablet {
            predicate: predicate.to_owned(),
            group_id: self.group,
            read_only: false,
        })
    }

    fn leader(&self, _group: u32) -> Option<Peer> {
        self.leader.lock().unwrap().clone()
    }

    fn my_peer(&self) -> Option<u64> {
        *self.my_peer.lock().unwrap()
    }

    fn members(&self, _group: u32) -> HashMap<u64, Member> {
        self.members.lock().unwrap().clone()
    }

    fn trigger_membership_sync(&self) {
        self.sync_count.fetch_add(1, Ordering::SeqCst);
    }

    fn apply_state(&self, state: MembershipState) {
        self.applied_states.lock().unwrap().push(state);
    }

    async fn update_membership_state(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn join_cluster(&self, _leader: &Peer, _rc: &RaftContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_peer(&self, _leader: &Peer, _rc: &RaftContext) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn try_abort(&self, start_timestamps: Vec<u64>) -> anyhow::Result<()> {
        self.aborts.lock().unwrap().push(start_timestamps);
        Ok(())
    }
}

#[derive(Default)]
struct NullTransport {
    sent: Mutex<Vec<(u64, usize)>>,
}

#[async_trait]
impl RaftTransport for NullTransport {
    async fn send(&self, peer: Peer, batch: Vec<Message>) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((peer.id, batch.len()));
        Ok(())
    }
}

struct HarnessOptions {
    propose_timeout: Duration,
    read_index_timeout: Duration,
    force_abort_difference: u64,
    /// Written into the WAL dir before the node starts.
    prewrite: Option<Box<dyn FnOnce(&FileWal) + Send>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            propose_timeout: Duration::from_secs(5),
            read_index_timeout: Duration::from_secs(2),
            force_abort_difference: 1_000,
            prewrite: None,
        }
    }
}

struct TestHarness {
    node: Arc<Node>,
    engine: Arc<StubEngine>,
    store: Arc<MemStore>,
    oracle: Arc<StubOracle>,
    cluster: Arc<StubCluster>,
    log: Arc<MemoryLog>,
    wal_dir: TempDir,
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

impl TestHarness {
    async fn start() -> TestHarness {
        Self::start_with(HarnessOptions::default()).await
    }

    async fn start_with(options: HarnessOptions) -> TestHarness {
        init_tracing();
        let wal_dir = TempDir::new().expect("wal tempdir");
        let wal = Arc::new(FileWal::open_dir(wal_dir.path()).expect("open wal"));
        if let Some(prewrite) = options.prewrite {
            prewrite(&wal);
        }

        let mut config = ReplicaConfig::new(NODE_ID, GROUP, "127.0.0.1:7080");
        config.propose_timeout = options.propose_timeout;
        config.read_index_timeout = options.read_index_timeout;
        config.force_abort_difference = options.force_abort_difference;

        let store = Arc::new(MemStore::default());
        let oracle = Arc::new(StubOracle::default());
        let cluster = Arc::new(StubCluster::new(GROUP));
        let transport = Arc::new(NullTransport::default());
        let log = Arc::new(MemoryLog::new());

        let node = Node::new(
            config,
            store.clone(),
            oracle.clone(),
            cluster.clone(),
            transport,
            wal.clone(),
            log.clone(),
        );
        let bootstrap = StubBootstrap::default();
        node.init_and_start(&bootstrap).await.expect("node start");

        TestHarness {
            node,
            engine: bootstrap.engine(),
            store,
            oracle,
            cluster,
            log,
            wal_dir,
        }
    }

    fn wal(&self) -> FileWal {
        FileWal::open_dir(self.wal_dir.path()).expect("reopen wal")
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

fn set_edge(entity: u64, attr: &str, value: &str) -> Edge {
    Edge {
        entity,
        attr: attr.to_owned(),
        value: value.as_bytes().to_vec(),
        value_type: ValueType::String,
        op: EdgeOp::Set,
    }
}

fn mutation(edges: Vec<Edge>, start_ts: u64) -> Proposal {
    Proposal {
        mutations: Some(Mutations {
            edges,
            schema: Vec::new(),
            start_ts,
        }),
        ..Proposal::default()
    }
}

fn commit_proposal(start_ts: u64, commit_ts: u64) -> Proposal {
    Proposal {
        txn_context: Some(TxnContext {
            start_ts,
            commit_ts,
            aborted: false,
            keys: Vec::new(),
        }),
        ..Proposal::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_mutation() {
    let h = TestHarness::start().await;

    h.node
        .propose_and_wait(mutation(vec![set_edge(0x1, "name", "alice")], 10))
        .await
        .expect("mutation should apply");

    assert_eq!(h.store.value_of(0x1, "name"), Some(b"alice".to_vec()));
    assert_eq!(h.node.applied().done_until(), 1);
    // Mutation applies wait for the oracle to observe the start timestamp.
    assert!(h.oracle.waits().contains(&10));
    // The txn watermark stays put until the commit proposal resolves it.
    assert_eq!(h.node.txn_marks().done_until(), 0);

    h.node
        .propose_and_wait(commit_proposal(10, 11))
        .await
        .expect("commit should apply");
    assert_eq!(h.node.txn_marks().done_until(), 2);
    assert_eq!(h.node.applied().done_until(), 2);
    assert_eq!(h.store.commit_count(), 1);

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_overwrite_serializes_on_shared_key() {
    let h = TestHarness::start().await;

    h.node
        .propose_and_wait(mutation(
            vec![
                set_edge(0x1, "name", "janardhan"),
                set_edge(0x1, "name", "pawan"),
            ],
            10,
        ))
        .await
        .expect("mutation should apply");

    // The second edge must have observed and un-indexed the first.
    assert_eq!(h.store.value_of(0x1, "name"), Some(b"pawan".to_vec()));
    assert!(h.store.reverse_lookup("name", b"janardhan").is_empty());
    assert_eq!(
        h.store.reverse_lookup("name", b"pawan"),
        HashSet::from([0x1])
    );

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_keys_apply_independently() {
    let h = TestHarness::start().await;

    let edges: Vec<Edge> = (1..=20)
        .map(|entity| set_edge(entity, "name", &format!("user-{entity}")))
        .collect();
    h.node
        .propose_and_wait(mutation(edges, 10))
        .await
        .expect("mutation should apply");

    for entity in 1..=20 {
        assert_eq!(
            h.store.value_of(entity, "name"),
            Some(format!("user-{entity}").into_bytes())
        );
    }
    assert_eq!(h.node.applied().done_until(), 1);

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_index_coalesces_concurrent_readers() {
    let h = TestHarness::start().await;
    h.node
        .propose_and_wait(mutation(vec![set_edge(0x1, "name", "alice")], 10))
        .await
        .unwrap();

    let mut readers = Vec::new();
    for _ in 0..50 {
        let node = h.node.clone();
        readers.push(tokio::spawn(
            async move { node.wait_linearizable_read().await },
        ));
    }
    for reader in readers {
        reader.await.unwrap().expect("linearizable read");
    }
    // Bursts share ReadIndex calls; far fewer than one per reader.
    let calls = h.engine.read_index_calls();
    assert!(calls >= 1 && calls < 50, "got {calls} ReadIndex calls");

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_index_failure_fails_all_waiters() {
    let h = TestHarness::start_with(HarnessOptions {
        read_index_timeout: Duration::from_millis(300),
        ..HarnessOptions::default()
    })
    .await;
    h.engine.set_read_mode(ReadMode::Silent);

    let mut readers = Vec::new();
    for _ in 0..50 {
        let node = h.node.clone();
        readers.push(tokio::spawn(
            async move { node.wait_linearizable_read().await },
        ));
    }
    for reader in readers {
        let err = reader.await.unwrap().expect_err("read must fail");
        assert_eq!(
            err.downcast_ref::<ReplicaError>(),
            Some(&ReplicaError::ReadIndex)
        );
    }

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn propose_error_surfaces_without_ghost_apply() {
    let h = TestHarness::start().await;
    h.engine.set_propose_mode(ProposeMode::Reject);

    let err = h
        .node
        .propose_and_wait(mutation(vec![set_edge(0x1, "name", "alice")], 10))
        .await
        .expect_err("propose must fail");
    assert!(err.to_string().contains("while proposing"), "{err:?}");

    assert_eq!(h.node.applied().done_until(), 0);
    assert_eq!(h.store.value_of(0x1, "name"), None);

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stranded_proposal_times_out() {
    let h = TestHarness::start_with(HarnessOptions {
        propose_timeout: Duration::from_millis(300),
        ..HarnessOptions::default()
    })
    .await;
    h.engine.set_propose_mode(ProposeMode::BlackHole);

    let err = h
        .node
        .propose_and_wait(mutation(vec![set_edge(0x1, "name", "alice")], 10))
        .await
        .expect_err("proposal must time out");
    assert_eq!(
        err.downcast_ref::<ReplicaError>(),
        Some(&ReplicaError::ProposalTimeout)
    );
    assert_eq!(h.node.applied().done_until(), 0);

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_resumes_past_snapshot() {
    let snapshot = Snapshot {
        data: RaftContext {
            id: NODE_ID,
            group: GROUP,
            addr: "127.0.0.1:7080".to_owned(),
        }
        .encode()
        .unwrap(),
        metadata: SnapshotMetadata {
            conf_state: ConfState { nodes: vec![NODE_ID] },
            index: 1000,
            term: 3,
        },
    };
    let h = TestHarness::start_with(HarnessOptions {
        prewrite: Some(Box::new(move |wal: &FileWal| {
            wal.store_snapshot(GROUP, &snapshot).unwrap();
            wal.store(
                GROUP,
                Some(HardState {
                    term: 3,
                    vote: NODE_ID,
                    commit: 1000,
                }),
                &[],
            )
            .unwrap();
        })),
        ..HarnessOptions::default()
    })
    .await;

    assert_eq!(h.node.applied().done_until(), 1000);
    assert_eq!(h.node.txn_marks().done_until(), 1000);
    assert_eq!(h.log.snapshot().unwrap().metadata.index, 1000);

    // The first committed entry after restart lands at 1001.
    h.node
        .propose_and_wait(mutation(vec![set_edge(0x1, "name", "alice")], 10))
        .await
        .expect("mutation after restart");
    assert_eq!(h.node.applied().done_until(), 1001);

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_backpressure_aborts_old_transactions() {
    let h = TestHarness::start_with(HarnessOptions {
        force_abort_difference: 1_000,
        ..HarnessOptions::default()
    })
    .await;
    h.oracle.set_stale_txns(vec![5, 9]);

    // A large applied-vs-txn gap, as left behind by abandoned transactions.
    h.node.applied().set_done_until(20_000);

    h.node.snapshot(10).await.expect("snapshot call");

    assert_eq!(h.cluster.aborts(), vec![vec![5, 9]]);
    // No snapshot may be created in that call.
    assert_eq!(h.log.snapshot().unwrap().metadata.index, 0);

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_lands_at_txn_watermark() {
    let h = TestHarness::start().await;

    h.node
        .propose_and_wait(mutation(vec![set_edge(0x1, "name", "alice")], 10))
        .await
        .unwrap();
    h.node
        .propose_and_wait(commit_proposal(10, 11))
        .await
        .unwrap();
    assert_eq!(h.node.txn_marks().done_until(), 2);

    h.node.snapshot(0).await.expect("explicit snapshot");

    assert_eq!(h.log.snapshot().unwrap().metadata.index, 2);
    let recovered = h.wal().recover(GROUP).unwrap();
    assert_eq!(recovered.snapshot.unwrap().metadata.index, 2);

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn self_authored_snapshot_is_not_installed() {
    let h = TestHarness::start().await;
    h.cluster.set_leader(Peer {
        id: 2,
        addr: "127.0.0.1:7081".to_owned(),
    });

    let own = RaftContext {
        id: NODE_ID,
        group: GROUP,
        addr: "127.0.0.1:7080".to_owned(),
    };
    h.engine
        .push_ready(Ready {
            snapshot: Snapshot {
                data: own.encode().unwrap(),
                metadata: SnapshotMetadata {
                    conf_state: ConfState { nodes: vec![NODE_ID] },
                    index: 50,
                    term: 1,
                },
            },
            ..Ready::default()
        })
        .await;

    wait_until(|| h.log.snapshot().unwrap().metadata.index == 50).await;
    assert_eq!(h.store.populate_calls.load(Ordering::SeqCst), 0);

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn foreign_snapshot_streams_shard_from_leader() {
    let h = TestHarness::start().await;
    h.cluster.set_leader(Peer {
        id: 2,
        addr: "127.0.0.1:7081".to_owned(),
    });

    let leader_ctx = RaftContext {
        id: 2,
        group: GROUP,
        addr: "127.0.0.1:7081".to_owned(),
    };
    h.engine
        .push_ready(Ready {
            snapshot: Snapshot {
                data: leader_ctx.encode().unwrap(),
                metadata: SnapshotMetadata {
                    conf_state: ConfState { nodes: vec![NODE_ID, 2] },
                    index: 80,
                    term: 1,
                },
            },
            ..Ready::default()
        })
        .await;

    wait_until(|| h.log.snapshot().unwrap().metadata.index == 80).await;
    assert_eq!(h.store.populate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.evictions.load(Ordering::SeqCst), 1);

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn legacy_numeric_id_is_rewritten() {
    let h = TestHarness::start().await;

    let proposal = Proposal {
        deprecated_id: 42,
        state: Some(MembershipState::default()),
        ..Proposal::default()
    };
    h.engine
        .commit_entry(EntryType::Normal, proposal.encode().unwrap())
        .await
        .unwrap();

    wait_until(|| h.cluster.applied_state_count() == 1).await;
    wait_until(|| h.node.applied().done_until() == 1).await;

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conf_change_connects_peer_and_resyncs_membership() {
    let h = TestHarness::start().await;
    let syncs_before = h.cluster.sync_count();

    let rc = RaftContext {
        id: 2,
        group: GROUP,
        addr: "127.0.0.1:7081".to_owned(),
    };
    h.node
        .propose_conf_change(ConfChange {
            id: 7,
            change_type: ConfChangeType::AddNode,
            node_id: 2,
            context: rc.encode().unwrap(),
        })
        .await
        .expect("conf change should apply");

    assert_eq!(h.node.applied().done_until(), 1);
    wait_until(|| h.cluster.sync_count() > syncs_before).await;

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_entries_advance_applied_mark() {
    let h = TestHarness::start().await;

    // Raft no-op, as emitted on leader election.
    h.engine
        .commit_entry(EntryType::Normal, Vec::new())
        .await
        .unwrap();

    wait_until(|| h.node.applied().done_until() == 1).await;

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_side_sequencing_waits_for_min_applied() {
    let h = TestHarness::start().await;
    h.node
        .propose_and_wait(mutation(vec![set_edge(0x1, "name", "alice")], 10))
        .await
        .unwrap();

    let read = LinRead {
        sequencing: Sequencing::ClientSide,
        ids: HashMap::from([(GROUP, 1u64)]),
    };
    tokio::time::timeout(
        Duration::from_secs(1),
        h.node.wait_for_min_proposal(Some(&read)),
    )
    .await
    .expect("min-proposal wait must not block")
    .expect("min-proposal wait");

    h.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_is_idempotent() {
    let h = TestHarness::start().await;
    h.node.stop().await;
    // Second stop observes the done flag and returns immediately.
    tokio::time::timeout(Duration::from_secs(1), h.node.stop())
        .await
        .expect("second stop must not hang");
}
