use super::*;

use std::collections::BTreeMap;
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The index is committed.
    Ok,
    /// The commit index stood still for the whole timeout.
    Timeout,
    /// Leadership was lost. The entry may or may not get committed.
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollResult {
    /// Committed entries from the requested index up to `commit_index`.
    Log {
        entries: Vec<LogEntry>,
        commit_index: LogIndex,
    },
    /// The requested history was compacted away. The whole state instead.
    State {
        state: Value,
        first_index: LogIndex,
        commit_index: LogIndex,
    },
    /// Nothing was committed before the deadline.
    NoUpdate { commit_index: LogIndex },
}

struct PendingPoll {
    target: LogIndex,
    tx: oneshot::Sender<Result<PollResult>>,
}

/// Pending polls ordered by their deadline.
pub struct PollRegistry {
    pending: BTreeMap<(Instant, u64), PendingPoll>,
    lowest_target: Option<LogIndex>,
    next_id: u64,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            lowest_target: None,
            next_id: 0,
        }
    }

    pub fn n_pending(&self) -> usize {
        self.pending.len()
    }

    fn recompute_lowest(&mut self) {
        self.lowest_target = self.pending.values().map(|p| p.target).min();
    }

    pub fn register(
        &mut self,
        target: LogIndex,
        deadline: Instant,
        tx: oneshot::Sender<Result<PollResult>>,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert((deadline, id), PendingPoll { target, tx });
        self.lowest_target = Some(match self.lowest_target {
            Some(cur) => LogIndex::min(cur, target),
            None => target,
        });
    }

    pub fn lowest_target(&self) -> Option<LogIndex> {
        self.lowest_target
    }

    /// Answer every poll whose target is committed.
    /// `entries` must cover `[lowest_target, commit_index]`.
    pub fn resolve(&mut self, commit_index: LogIndex, entries: &[LogEntry]) -> usize {
        if self.lowest_target.map(|i| i > commit_index).unwrap_or(true) {
            return 0;
        }
        let keys: Vec<(Instant, u64)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.target <= commit_index)
            .map(|(k, _)| *k)
            .collect();
        for k in &keys {
            if let Some(p) = self.pending.remove(k) {
                let entries = entries
                    .iter()
                    .filter(|e| e.index >= p.target)
                    .cloned()
                    .collect();
                // The poller may have given up.
                p.tx
                    .send(Ok(PollResult::Log {
                        entries,
                        commit_index,
                    }))
                    .ok();
            }
        }
        self.recompute_lowest();
        keys.len()
    }

    /// Answer `NoUpdate` to every poll whose deadline passed.
    pub fn expire(&mut self, now: Instant, commit_index: LogIndex) -> usize {
        let rest = self.pending.split_off(&(now, u64::MAX));
        let expired = std::mem::replace(&mut self.pending, rest);
        let n = expired.len();
        for (_, p) in expired {
            p.tx.send(Ok(PollResult::NoUpdate { commit_index })).ok();
        }
        if n > 0 {
            self.recompute_lowest();
        }
        n
    }

    /// Fail every poll with `NotLeader`.
    pub fn resign(&mut self, leader: Option<MemberId>) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let n = pending.len();
        for (_, p) in pending {
            let e = Error::NotLeader {
                leader: leader.clone(),
            };
            p.tx.send(Err(e.into())).ok();
        }
        self.lowest_target = None;
        n
    }
}

impl Agent {
    /// Wait until `index` is committed.
    /// The timeout restarts every time the commit index moves.
    pub async fn wait_for(&self, index: LogIndex, timeout: Duration) -> WaitResult {
        let mut rx = self.core.status_tx.subscribe();
        let mut seen = rx.borrow().commit_index;
        let mut deadline = Instant::now() + timeout;
        loop {
            let status = *rx.borrow_and_update();
            if !status.leading {
                return WaitResult::Unknown;
            }
            if status.commit_index >= index {
                return WaitResult::Ok;
            }
            if status.commit_index > seen {
                seen = status.commit_index;
                deadline = Instant::now() + timeout;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Err(_) => return WaitResult::Timeout,
                Ok(Err(_)) => return WaitResult::Unknown,
                Ok(Ok(())) => {}
            }
        }
    }

    /// Whether `index` is committed and this agent still leads.
    pub fn is_committed(&self, index: LogIndex) -> bool {
        let status = self.core.status();
        status.leading && status.commit_index >= index
    }

    /// Committed entries from `index` on.
    /// Waits up to `timeout` for `index` to be committed.
    pub async fn poll(&self, index: LogIndex, timeout: Duration) -> Result<PollResult> {
        let core = &self.core;
        ensure!(core.sync_leadership().await?, core.not_leader());

        let rx = {
            let commit = core.commit.lock().await;
            ensure!(core.status().leading, core.not_leader());

            let first_index = core.store.first_index().await?;
            if index <= first_index {
                let (state, _) = core.store.dump_state().await?;
                return Ok(PollResult::State {
                    state,
                    first_index,
                    commit_index: commit.commit_index,
                });
            }
            if index <= commit.commit_index {
                let entries = core.store.get_range(index, commit.commit_index).await?;
                return Ok(PollResult::Log {
                    entries,
                    commit_index: commit.commit_index,
                });
            }

            // Registered under the commit lock so no commit slips in between.
            let (tx, rx) = oneshot::channel();
            core.polls
                .lock()
                .register(index, Instant::now() + timeout, tx);
            rx
        };

        match rx.await {
            Ok(resp) => resp,
            Err(_) => Err(core.not_leader().into()),
        }
    }
}
