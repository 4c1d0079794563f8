use super::*;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

mod api;
pub use api::*;
/// Wire format of append-entries bodies.
pub mod codec;
mod commit;
pub use commit::quorum_index;
mod compaction;
mod ingest;
mod progress;
pub use progress::FollowerReport;
mod replication;
pub use replication::{plan_replication, ReplicationPlan};
mod thread;
use thread::*;
mod wait;
pub use wait::{PollResult, WaitResult};

/// Election term.
pub type Term = u64;

/// Log index. The first entry of a log has index 1.
pub type LogIndex = u64;

/// Log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    /// Operations for the state machine. `null` is a no-op.
    pub payload: Value,
    /// Set by clients that need to detect re-submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
}

/// State machine contents after applying every entry up to `index`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: Value,
    pub index: LogIndex,
    pub term: Term,
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `Constituent` is the election component.
/// It decides who leads in which term; the agent only follows its decisions.
#[async_trait::async_trait]
pub trait Constituent: Sync + Send + 'static {
    fn leader_id(&self) -> Option<MemberId>;

    fn term(&self) -> Term;

    fn is_leading(&self) -> bool;

    /// Whether an append-entries call from `leader_id` at `term` whose previous entry
    /// is `(prev_index, prev_term)` is a plausible continuation of the local log.
    /// `(0, 0)` denotes the beginning of the log.
    async fn check_leader(
        &self,
        term: Term,
        leader_id: &MemberId,
        prev_index: LogIndex,
        prev_term: Term,
    ) -> Result<bool>;

    /// Give up leadership. `term` is the highest term the caller has seen.
    async fn step_down(&self, term: Term);
}

/// `LogStore` is the durable log together with the document store
/// the committed entries are applied to.
#[async_trait::async_trait]
pub trait LogStore: Sync + Send + 'static {
    /// Append entries, replacing conflicting suffixes and skipping entries
    /// already present with the same term.
    /// Returns the highest supplied index that is now in the log
    /// which may be lower than the last supplied one.
    async fn append_entries(&self, entries: Vec<LogEntry>) -> Result<LogIndex>;

    /// Entries in `[from, to]` that are still retained.
    async fn get_range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>>;

    /// Index of the first retained entry.
    async fn first_index(&self) -> Result<LogIndex>;

    /// Index of the last entry. The snapshot index if the log is empty after compaction.
    async fn last_index(&self) -> Result<LogIndex>;

    async fn load_latest_snapshot(&self) -> Result<Option<Snapshot>>;

    /// Replace the state machine and the log prefix with the snapshot.
    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Take a snapshot at `index` and discard entries in `[, index - keep]`.
    /// `index` must be the index the state machine was applied up to.
    async fn compact(&self, index: LogIndex, keep: u64) -> Result<()>;

    /// Apply committed entries in order. Returns one effect per entry.
    async fn apply_entries(
        &self,
        entries: &[LogEntry],
        commit_index: LogIndex,
        term: Term,
    ) -> Result<Vec<Value>>;

    async fn read(&self, query: &Value) -> Result<Vec<Value>>;

    /// Full state machine contents and the index it was applied up to.
    async fn dump_state(&self) -> Result<(Value, LogIndex)>;

    /// Indices of the entries written with `client_id`.
    async fn find_client_requests(&self, client_id: &str) -> Result<Vec<LogIndex>>;
}

#[async_trait::async_trait]
pub trait Transport: Sync + Send + 'static {
    async fn append_entries(
        &self,
        to: &MemberId,
        req: request::AppendEntries,
    ) -> Result<response::AppendEntries>;
}

/// What waiters observe.
/// `commit_index` is published only after the state machine reflects it.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Status {
    commit_index: LogIndex,
    /// In office as leader.
    leading: bool,
    term: Term,
}

/// Guarded by the commit lock.
struct CommitState {
    commit_index: LogIndex,
    last_compaction_at: LogIndex,
    /// Entry appended on taking office.
    /// Reads are served once it is committed.
    readiness_index: Option<LogIndex>,
}

/// Lock order: `commit` -> `progress`, `commit` -> `polls`.
/// `progress` and `polls` are never held across an await.
struct Core {
    config: AgencyConfig,
    constituent: Arc<dyn Constituent>,
    store: Arc<dyn LogStore>,
    transport: Arc<dyn Transport>,

    commit: tokio::sync::Mutex<CommitState>,
    status_tx: watch::Sender<Status>,
    progress: parking_lot::Mutex<progress::Progress>,
    polls: parking_lot::Mutex<wait::PollRegistry>,

    applied_tx: broadcast::Sender<Arc<Vec<LogEntry>>>,
    ready: AtomicBool,
    driver_evt_tx: EventProducer<DriverEvent>,
    compaction_evt_tx: EventProducer<CompactionEvent>,
}

impl Core {
    fn self_id(&self) -> &MemberId {
        &self.config.id
    }

    fn status(&self) -> Status {
        *self.status_tx.borrow()
    }

    fn not_leader(&self) -> Error {
        Error::NotLeader {
            leader: self.constituent.leader_id(),
        }
    }

    /// Follow the election component.
    /// Returns whether this agent is in office afterwards.
    async fn sync_leadership(&self) -> Result<bool> {
        let leading = self.constituent.is_leading() && self.ready.load(Ordering::SeqCst);
        let term = self.constituent.term();
        let status = self.status();
        if leading {
            if !status.leading || status.term != term {
                self.take_office(term).await?;
            }
            Ok(self.status().leading)
        } else {
            if status.leading {
                self.resign().await;
            }
            Ok(false)
        }
    }

    async fn take_office(&self, term: Term) -> Result<()> {
        let mut commit = self.commit.lock().await;
        let status = self.status();
        if status.leading && status.term == term {
            return Ok(());
        }

        self.progress.lock().reset(Instant::now());

        let index = self.store.last_index().await? + 1;
        let noop = LogEntry {
            index,
            term,
            payload: Value::Null,
            client_id: None,
            timestamp: now_millis(),
        };
        let stored = self.store.append_entries(vec![noop]).await?;
        ensure!(stored == index, Error::EntryNotFound(index));
        commit.readiness_index = Some(index);

        self.status_tx.send_modify(|s| {
            s.leading = true;
            s.term = term;
        });
        info!("took office at term={term}. readiness_index={index}");
        self.driver_evt_tx.push_event(DriverEvent);
        Ok(())
    }

    /// Leave office locally.
    /// Waiters return `Unknown` and pending polls fail with `NotLeader`.
    async fn resign(&self) {
        let mut commit = self.commit.lock().await;
        commit.readiness_index = None;
        let was_leading = self.status().leading;
        self.status_tx.send_modify(|s| s.leading = false);
        let n = self.polls.lock().resign(self.constituent.leader_id());
        if was_leading {
            info!("resigned. failed {n} pending polls");
        }
    }

    async fn step_down(&self, term: Term) {
        self.constituent.step_down(term).await;
        self.resign().await;
    }

    fn challenged(&self) -> bool {
        self.progress
            .lock()
            .challenged(Instant::now(), self.config.challenge_window())
    }

    /// Step down if a majority stopped acknowledging heartbeats.
    async fn ensure_unchallenged(&self) -> Result<()> {
        if self.challenged() {
            let term = self.status().term;
            warn!("leadership challenged at term={term}. step down");
            self.step_down(term).await;
            bail!(Error::LeadershipChallenged);
        }
        Ok(())
    }
}

#[allow(dead_code)]
struct ThreadHandles {
    driver_handle: ThreadHandle,
    heartbeat_handle: ThreadHandle,
    compaction_handle: ThreadHandle,
}

/// `Agent` is a member of the Agency.
/// While its `Constituent` says it leads, it replicates the log to the other members
/// and commits entries once a quorum acknowledged them.
/// Otherwise it accepts entries from the leader through `receive_append_entries`.
pub struct Agent {
    core: Arc<Core>,
    thread_handles: parking_lot::Mutex<Option<ThreadHandles>>,
}

impl Agent {
    pub async fn new(
        config: AgencyConfig,
        constituent: Arc<dyn Constituent>,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        // An agent must never run with a state machine behind its commit index.
        // Any failure here is fatal to the caller.
        let snapshot = store
            .load_latest_snapshot()
            .await
            .context("failed to load the latest snapshot")?;
        let (_, mut commit_index) = store
            .dump_state()
            .await
            .context("failed to read the state machine")?;
        let mut last_compaction_at = 0;
        if let Some(snapshot) = snapshot {
            last_compaction_at = snapshot.index;
            if commit_index < snapshot.index {
                let index = snapshot.index;
                store
                    .install_snapshot(snapshot)
                    .await
                    .with_context(|| format!("failed to rebuild the state from snapshot@{index}"))?;
                commit_index = index;
            }
        }
        info!("restore state: commit_index={commit_index}, last_compaction_at={last_compaction_at}");

        let (driver_evt_tx, driver_evt_rx) = thread::notify();
        let (compaction_evt_tx, compaction_evt_rx) = thread::notify();
        let (status_tx, _) = watch::channel(Status {
            commit_index,
            leading: false,
            term: 0,
        });
        let (applied_tx, _) = broadcast::channel(1024);
        let progress = progress::Progress::new(
            config.id.clone(),
            &config.active,
            config.max_append_size,
            Instant::now(),
        );

        let core = Arc::new(Core {
            config,
            constituent,
            store,
            transport,
            commit: tokio::sync::Mutex::new(CommitState {
                commit_index,
                last_compaction_at,
                readiness_index: None,
            }),
            status_tx,
            progress: parking_lot::Mutex::new(progress),
            polls: parking_lot::Mutex::new(wait::PollRegistry::new()),
            applied_tx,
            ready: AtomicBool::new(true),
            driver_evt_tx,
            compaction_evt_tx,
        });

        let thread_handles = ThreadHandles {
            driver_handle: thread::driver::run(core.clone(), driver_evt_rx),
            heartbeat_handle: thread::heartbeat::run(core.clone()),
            compaction_handle: thread::compactor::run(core.clone(), compaction_evt_rx),
        };

        Ok(Self {
            core,
            thread_handles: parking_lot::Mutex::new(Some(thread_handles)),
        })
    }

    pub fn id(&self) -> &MemberId {
        self.core.self_id()
    }

    /// Whether this agent is in office as leader.
    pub fn is_leading(&self) -> bool {
        self.core.status().leading
    }

    pub fn last_committed_index(&self) -> LogIndex {
        self.core.status().commit_index
    }

    /// Append a batch of transactions to the log.
    /// The call returns once the entries are in the local log.
    /// Use `wait_for` on the returned indices to wait for the commit.
    pub async fn write(&self, batch: Vec<request::Transaction>) -> Result<response::Write> {
        let core = &self.core;
        if !core.sync_leadership().await? {
            return Ok(response::Write::rejected(core.constituent.leader_id()));
        }
        if let Err(e) = core.ensure_unchallenged().await {
            debug!("write rejected: {e}");
            return Ok(response::Write::rejected(None));
        }

        let indices = {
            let _commit = core.commit.lock().await;
            // Leadership may have changed while waiting for the lock.
            let status = core.status();
            if !status.leading {
                return Ok(response::Write::rejected(core.constituent.leader_id()));
            }
            let last_index = core.store.last_index().await?;
            let timestamp = now_millis();
            let entries: Vec<LogEntry> = batch
                .into_iter()
                .zip(last_index + 1..)
                .map(|(tx, index)| LogEntry {
                    index,
                    term: status.term,
                    payload: tx.payload,
                    client_id: tx.client_id,
                    timestamp,
                })
                .collect();
            let indices: Vec<LogIndex> = entries.iter().map(|e| e.index).collect();
            if let Some(&last_new) = indices.last() {
                let stored = core.store.append_entries(entries).await?;
                ensure!(
                    stored == last_new,
                    "log store stored entries up to {stored} out of {last_new}"
                );
            }
            indices
        };

        core.driver_evt_tx.push_event(DriverEvent);
        Ok(response::Write {
            accepted: true,
            leader_id: Some(self.id().clone()),
            indices,
        })
    }

    /// Run a query against the committed state.
    pub async fn read(&self, query: Value) -> Result<response::Read> {
        let core = &self.core;
        if !core.sync_leadership().await? {
            return Ok(response::Read::rejected(core.constituent.leader_id()));
        }
        if let Err(e) = core.ensure_unchallenged().await {
            debug!("read rejected: {e}");
            return Ok(response::Read::rejected(None));
        }

        let commit = core.commit.lock().await;
        if !core.status().leading {
            return Ok(response::Read::rejected(core.constituent.leader_id()));
        }
        let ready = commit
            .readiness_index
            .map(|i| commit.commit_index >= i)
            .unwrap_or(false);
        ensure!(ready, Error::NotReady);

        let results = core.store.read(&query).await?;
        Ok(response::Read {
            accepted: true,
            leader_id: Some(self.id().clone()),
            results,
        })
    }

    /// Find the log indices of earlier writes by client request id.
    pub async fn inquire(&self, client_ids: &[String]) -> Result<HashMap<String, Vec<LogIndex>>> {
        let core = &self.core;
        ensure!(core.sync_leadership().await?, core.not_leader());

        let mut out = HashMap::new();
        for id in client_ids {
            let indices = core.store.find_client_requests(id).await?;
            out.insert(id.clone(), indices);
        }
        Ok(out)
    }

    /// Entry point of an append-entries call from the leader.
    pub async fn receive_append_entries(
        &self,
        req: request::AppendEntries,
    ) -> Result<response::AppendEntries> {
        ingest::Effect { core: &self.core }.exec(req).await
    }

    /// Replace the set of active members (this agent included).
    pub fn set_active_members(&self, members: &[MemberId]) {
        self.core
            .progress
            .lock()
            .sync_membership(members, Instant::now());
        info!("active members -> {members:?}");
    }

    pub fn progress_report(&self) -> Vec<FollowerReport> {
        self.core.progress.lock().report(Instant::now())
    }

    /// Batches of entries applied to the state machine, in index order.
    pub fn subscribe_applied(&self) -> broadcast::Receiver<Arc<Vec<LogEntry>>> {
        self.core.applied_tx.subscribe()
    }

    /// Give up leadership.
    pub async fn resign(&self) {
        let term = self.core.constituent.term();
        self.core.step_down(term).await;
    }

    /// Stop background work. Waiters and pending polls are released.
    pub async fn shutdown(&self) {
        self.core.ready.store(false, Ordering::SeqCst);
        self.core.resign().await;
        self.thread_handles.lock().take();
        info!("agent {} shut down", self.id());
    }
}
