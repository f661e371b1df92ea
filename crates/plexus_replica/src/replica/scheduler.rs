//! Mutation scheduler.
//!
//! Within one proposal, edges that touch the same posting key must observe
//! each other's effects in order (index maintenance reads the previous value
//! of the key), while edges on distinct keys are free to run concurrently.
//! The scheduler partitions a proposal's edges by key fingerprint: each
//! fingerprint owns a FIFO chain served by one worker task, and independent
//! chains fan out. Schema updates in the same proposal run as one aggregate
//! task after every edge task has finished.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::Instrument;

use super::error::ReplicaError;
use super::node::Node;
use super::types::{ApplyContext, Edge, Proposal, SchemaUpdate};

/// One edge mutation queued behind its key.
#[derive(Clone, Debug)]
pub(super) struct Task {
    /// Proposal key the task belongs to.
    pid: String,
    /// Raft index the proposal committed at.
    rid: u64,
    edge: Edge,
}

/// Schema work held back until the proposal's edge tasks drain.
struct SchemaWork {
    remaining: usize,
    schema: Vec<SchemaUpdate>,
    start_ts: u64,
    index: u64,
}

#[derive(Default)]
pub(super) struct Scheduler {
    /// Key fingerprint to pending tasks. The head of each queue is running.
    tasks: Mutex<HashMap<u64, VecDeque<Task>>>,
    pending_schema: Mutex<HashMap<String, SchemaWork>>,
}

fn key_fingerprint(edge: &Edge) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(edge.attr.as_bytes());
    hasher.update(&edge.entity.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8-byte digest prefix"))
}

impl Scheduler {
    /// Fan a committed mutations proposal out into tasks.
    ///
    /// Ref accounting: the proposal enters with one base reference. We add
    /// one per edge task plus one for the aggregate schema task, then drop
    /// the base reference once fan-out is complete, so a proposal with no
    /// tasks still completes and emits its applied mark exactly once.
    pub(super) fn schedule(&self, node: &Arc<Node>, proposal: &Proposal, index: u64) {
        let mutations = proposal
            .mutations
            .as_ref()
            .expect("scheduled proposal without mutations");
        let key = proposal.key.clone();

        if mutations.start_ts == 0 {
            // Schema-only proposal: no transaction to defer the txn mark to.
            node.props.inc_ref(&key, 1);
            let schema = mutations.schema.clone();
            let node_task = node.clone();
            let pid = key.clone();
            tokio::spawn(async move {
                let res = node_task
                    .process_schema_mutations(&pid, index, 0, &schema)
                    .await;
                node_task.txn_marks.done(index);
                node_task.props.done(&pid, res.err());
            });
            node.props.done(&key, None);
            return;
        }

        let txn = node.oracle.register(mutations.start_ts);
        txn.add_index(index);
        node.props.attach_txn(&key, txn);

        let edge_count = mutations.edges.len();
        let has_schema = !mutations.schema.is_empty();
        let extra = edge_count as i64 + i64::from(has_schema);
        if extra > 0 {
            node.props.inc_ref(&key, extra);
        }

        if has_schema {
            let work = SchemaWork {
                remaining: edge_count,
                schema: mutations.schema.clone(),
                start_ts: mutations.start_ts,
                index,
            };
            if edge_count == 0 {
                Self::spawn_schema(node.clone(), key.clone(), work);
            } else {
                self.pending_schema
                    .lock()
                    .expect("scheduler schema lock")
                    .insert(key.clone(), work);
            }
        }

        for edge in &mutations.edges {
            let task = Task {
                pid: key.clone(),
                rid: index,
                edge: edge.clone(),
            };
            let fp = key_fingerprint(&task.edge);
            let run_now = {
                let mut tasks = self.tasks.lock().expect("scheduler task lock");
                let queue = tasks.entry(fp).or_default();
                queue.push_back(task.clone());
                queue.len() == 1
            };
            if run_now {
                Self::spawn_chain(node.clone(), fp, task);
            }
        }

        node.props.done(&key, None);
    }

    /// Serve one key chain until its queue drains.
    fn spawn_chain(node: Arc<Node>, fp: u64, first: Task) {
        tokio::spawn(async move {
            let mut task = first;
            loop {
                let err = node.process_mutation(&task).await.err();
                node.props.done(&task.pid, err);
                node.sch.edge_task_finished(&node, &task.pid);

                let next = {
                    let mut tasks = node.sch.tasks.lock().expect("scheduler task lock");
                    let queue = tasks.get_mut(&fp).expect("running chain lost its queue");
                    queue.pop_front();
                    match queue.front() {
                        Some(task) => Some(task.clone()),
                        None => {
                            tasks.remove(&fp);
                            None
                        }
                    }
                };
                match next {
                    Some(next) => task = next,
                    None => return,
                }
            }
        });
    }

    fn edge_task_finished(&self, node: &Arc<Node>, pid: &str) {
        let work = {
            let mut pending = self.pending_schema.lock().expect("scheduler schema lock");
            let Some(work) = pending.get_mut(pid) else {
                return;
            };
            work.remaining -= 1;
            if work.remaining > 0 {
                return;
            }
            pending.remove(pid).expect("schema work vanished under lock")
        };
        Self::spawn_schema(node.clone(), pid.to_owned(), work);
    }

    fn spawn_schema(node: Arc<Node>, pid: String, work: SchemaWork) {
        tokio::spawn(async move {
            let res = node
                .process_schema_mutations(&pid, work.index, work.start_ts, &work.schema)
                .await;
            node.props.done(&pid, res.err());
        });
    }
}

impl Node {
    /// Apply one edge mutation under its proposal's transaction.
    pub(super) async fn process_mutation(&self, task: &Task) -> anyhow::Result<()> {
        let (span, txn) = self.props.ctx_and_txn(&task.pid);
        let txn = txn.ok_or_else(|| anyhow::anyhow!("mutation task without a transaction"))?;
        if txn.should_abort() {
            return Err(ReplicaError::Conflict.into());
        }

        // Index updates would be wrong without this wait. Applying
        // <0x1> name "janardhan" then <0x1> name "pawan" in one proposal,
        // the second mutation reads the old value of name to delete it from
        // the index; before the oracle has observed start_ts that read could
        // come from a stale snapshot.
        self.oracle.wait_for_ts(txn.start_ts()).await;

        let ctx = ApplyContext {
            group: self.gid(),
            index: task.rid,
        };
        self.store
            .run_mutation(ctx, &task.edge, &txn)
            .instrument(span)
            .await
    }

    pub(super) async fn process_schema_mutations(
        &self,
        pid: &str,
        index: u64,
        start_ts: u64,
        schema: &[SchemaUpdate],
    ) -> anyhow::Result<()> {
        let (span, _) = self.props.ctx_and_txn(pid);
        let ctx = ApplyContext {
            group: self.gid(),
            index,
        };
        self.store
            .run_schema_mutation(ctx, schema, start_ts)
            .instrument(span)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::types::{EdgeOp, ValueType};

    fn edge(entity: u64, attr: &str) -> Edge {
        Edge {
            entity,
            attr: attr.to_owned(),
            value: b"v".to_vec(),
            value_type: ValueType::Default,
            op: EdgeOp::Set,
        }
    }

    #[test]
    fn same_key_edges_share_a_fingerprint() {
        assert_eq!(
            key_fingerprint(&edge(1, "name")),
            key_fingerprint(&edge(1, "name"))
        );
        assert_ne!(
            key_fingerprint(&edge(1, "name")),
            key_fingerprint(&edge(2, "name"))
        );
        assert_ne!(
            key_fingerprint(&edge(1, "name")),
            key_fingerprint(&edge(1, "age"))
        );
    }
}
