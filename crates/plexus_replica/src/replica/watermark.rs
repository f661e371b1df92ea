//! Monotone progress counters over Raft log indices.
//!
//! A [`WaterMark`] tracks which indices have been begun and completed.
//! `done_until` only advances over a contiguous prefix of completed indices,
//! so out-of-order completions never expose a gap to readers waiting on
//! [`WaterMark::wait_for_mark`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

pub struct WaterMark {
    name: &'static str,
    done_until: AtomicU64,
    last_index: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Outstanding begin count per index. An index leaves the map when its
    /// count returns to zero.
    pending: BTreeMap<u64, i64>,
    waiters: BTreeMap<u64, Vec<oneshot::Sender<()>>>,
}

impl WaterMark {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            done_until: AtomicU64::new(0),
            last_index: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record that work for `index` has started. Must be called in ascending
    /// index order by the single producer.
    pub fn begin(&self, index: u64) {
        self.last_index.fetch_max(index, Ordering::AcqRel);
        let mut inner = self.inner.lock().expect("watermark lock");
        *inner.pending.entry(index).or_insert(0) += 1;
    }

    /// Record that one unit of work for `index` has finished. Unknown indices
    /// are ignored, which tolerates a duplicate done after replay.
    pub fn done(&self, index: u64) {
        let mut woken = Vec::new();
        {
            let mut inner = self.inner.lock().expect("watermark lock");
            match inner.pending.get_mut(&index) {
                Some(count) => {
                    *count -= 1;
                    if *count <= 0 {
                        inner.pending.remove(&index);
                    } else {
                        return;
                    }
                }
                None => return,
            }

            let advanced = match inner.pending.keys().next() {
                Some(min_pending) => min_pending - 1,
                None => self.last_index.load(Ordering::Acquire),
            };
            let current = self.done_until.load(Ordering::Acquire);
            if advanced <= current {
                return;
            }
            self.done_until.store(advanced, Ordering::Release);
            tracing::trace!(mark = self.name, done_until = advanced, "watermark advanced");

            let still_waiting = inner.waiters.split_off(&(advanced + 1));
            let ready = std::mem::replace(&mut inner.waiters, still_waiting);
            woken.extend(ready.into_values().flatten());
        }
        for tx in woken {
            let _ = tx.send(());
        }
    }

    /// Highest index whose contiguous prefix is fully done.
    pub fn done_until(&self) -> u64 {
        self.done_until.load(Ordering::Acquire)
    }

    /// Highest index ever begun.
    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    /// Seed the mark after WAL recovery, before any begin.
    pub fn set_done_until(&self, index: u64) {
        self.done_until.fetch_max(index, Ordering::AcqRel);
        self.last_index.fetch_max(index, Ordering::AcqRel);
    }

    /// Resolve once `done_until() >= index`.
    pub async fn wait_for_mark(&self, index: u64) {
        if self.done_until() >= index {
            return;
        }
        let rx = {
            let mut inner = self.inner.lock().expect("watermark lock");
            // Re-check under the lock so a concurrent done cannot strand us.
            if self.done_until() >= index {
                return;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(index).or_default().push(tx);
            rx
        };
        // A dropped sender only happens on advance-past-teardown; treat it as
        // the mark having been reached.
        let _ = rx.await;
    }
}
