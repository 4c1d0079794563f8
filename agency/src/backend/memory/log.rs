use super::*;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<LogIndex, LogEntry>,
    snapshot: Option<Snapshot>,
    /// The document store. An object payload sets its keys; `null` values delete.
    state: BTreeMap<String, Value>,
    applied_index: LogIndex,
    client_requests: HashMap<String, Vec<LogIndex>>,
}

impl Inner {
    fn snapshot_index(&self) -> LogIndex {
        self.snapshot.as_ref().map(|s| s.index).unwrap_or(0)
    }

    fn last_index(&self) -> LogIndex {
        match self.entries.last_key_value() {
            Some((&index, _)) => index,
            None => self.snapshot_index(),
        }
    }

    fn forget_client_requests(&mut self, removed: &BTreeMap<LogIndex, LogEntry>) {
        for e in removed.values() {
            if let Some(client_id) = &e.client_id {
                if let Some(indices) = self.client_requests.get_mut(client_id) {
                    indices.retain(|&i| i != e.index);
                    if indices.is_empty() {
                        self.client_requests.remove(client_id);
                    }
                }
            }
        }
    }

    /// Drop `[index, ..]`.
    fn truncate(&mut self, index: LogIndex) {
        let removed = self.entries.split_off(&index);
        self.forget_client_requests(&removed);
    }
}

/// Log and document store kept in memory.
#[derive(Default)]
pub struct MemoryLog {
    inner: Mutex<Inner>,
    append_limit: Option<usize>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb at most `n` new entries per append call.
    pub fn with_append_limit(n: usize) -> Self {
        Self {
            append_limit: Some(n),
            ..Self::default()
        }
    }

    /// Term of the entry at `index`, looking into the snapshot too.
    /// Index 0 is the beginning of the log.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        let inner = self.inner.lock();
        if let Some(e) = inner.entries.get(&index) {
            return Some(e.term);
        }
        match &inner.snapshot {
            Some(s) if s.index == index => Some(s.term),
            _ => None,
        }
    }

    /// Whether `index` is covered by the local snapshot.
    pub fn is_compacted(&self, index: LogIndex) -> bool {
        index <= self.inner.lock().snapshot_index()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().state.get(key).cloned()
    }

    pub fn applied_index(&self) -> LogIndex {
        self.inner.lock().applied_index
    }
}

fn apply_payload(state: &mut BTreeMap<String, Value>, payload: &Value) -> Value {
    let Value::Object(ops) = payload else {
        return Value::Null;
    };
    let mut old = serde_json::Map::new();
    for (k, v) in ops {
        let prev = if v.is_null() {
            state.remove(k)
        } else {
            state.insert(k.clone(), v.clone())
        };
        old.insert(k.clone(), prev.unwrap_or(Value::Null));
    }
    Value::Object(old)
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn append_entries(&self, entries: Vec<LogEntry>) -> Result<LogIndex> {
        let mut inner = self.inner.lock();
        let mut stored = 0;
        let mut n_new = 0;
        for e in entries {
            match inner.entries.get(&e.index) {
                Some(cur) if cur.term == e.term => {
                    stored = e.index;
                    continue;
                }
                Some(cur) => {
                    ensure!(
                        e.index > inner.applied_index,
                        "refuse to replace applied entry {} (term {} -> {})",
                        e.index,
                        cur.term,
                        e.term
                    );
                    inner.truncate(e.index);
                }
                None => {}
            }
            if e.index <= inner.snapshot_index() {
                stored = e.index;
                continue;
            }
            if e.index != inner.last_index() + 1 {
                break;
            }
            if self.append_limit.map(|n| n_new >= n).unwrap_or(false) {
                break;
            }

            if let Some(client_id) = &e.client_id {
                inner
                    .client_requests
                    .entry(client_id.clone())
                    .or_default()
                    .push(e.index);
            }
            stored = e.index;
            n_new += 1;
            inner.entries.insert(e.index, e);
        }
        Ok(stored)
    }

    async fn get_range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        if from > to {
            return Ok(vec![]);
        }
        let inner = self.inner.lock();
        Ok(inner.entries.range(from..=to).map(|(_, e)| e.clone()).collect())
    }

    async fn first_index(&self) -> Result<LogIndex> {
        let inner = self.inner.lock();
        let out = match inner.entries.first_key_value() {
            Some((&index, _)) => index,
            None => inner.snapshot_index() + 1,
        };
        Ok(out)
    }

    async fn last_index(&self) -> Result<LogIndex> {
        Ok(self.inner.lock().last_index())
    }

    async fn load_latest_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.inner.lock().snapshot.clone())
    }

    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let Value::Object(state) = &snapshot.state else {
            bail!("snapshot@{} is not an object", snapshot.index);
        };
        let mut inner = self.inner.lock();

        // The log after the snapshot survives only if it continues it.
        let continues = inner
            .entries
            .get(&snapshot.index)
            .map(|e| e.term == snapshot.term)
            .unwrap_or(false);
        if continues {
            let rest = inner.entries.split_off(&(snapshot.index + 1));
            inner.entries = rest;
        } else {
            inner.truncate(0);
        }

        inner.state = state.clone().into_iter().collect();
        inner.applied_index = snapshot.index;
        inner.snapshot = Some(snapshot);
        Ok(())
    }

    async fn compact(&self, index: LogIndex, keep: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure!(
            index == inner.applied_index,
            "compaction at {index} but the state is at {}",
            inner.applied_index
        );
        let term = match inner.entries.get(&index) {
            Some(e) => e.term,
            None => match &inner.snapshot {
                Some(s) if s.index == index => s.term,
                _ => bail!(Error::EntryNotFound(index)),
            },
        };
        let state = Value::Object(inner.state.clone().into_iter().collect());
        inner.snapshot = Some(Snapshot { state, index, term });

        let discard_to = index.saturating_sub(keep);
        let rest = inner.entries.split_off(&(discard_to + 1));
        inner.entries = rest;
        Ok(())
    }

    async fn apply_entries(
        &self,
        entries: &[LogEntry],
        commit_index: LogIndex,
        _term: Term,
    ) -> Result<Vec<Value>> {
        let mut inner = self.inner.lock();
        let mut effects = Vec::with_capacity(entries.len());
        for e in entries {
            ensure!(
                e.index == inner.applied_index + 1,
                "apply {} after {}",
                e.index,
                inner.applied_index
            );
            ensure!(e.index <= commit_index, "apply {} beyond commit {commit_index}", e.index);
            effects.push(apply_payload(&mut inner.state, &e.payload));
            inner.applied_index = e.index;
        }
        Ok(effects)
    }

    /// `query` is a key or an array of keys.
    async fn read(&self, query: &Value) -> Result<Vec<Value>> {
        let inner = self.inner.lock();
        let lookup = |k: &Value| -> Result<Value> {
            let k = k.as_str().context("query keys must be strings")?;
            Ok(inner.state.get(k).cloned().unwrap_or(Value::Null))
        };
        match query {
            Value::Array(keys) => keys.iter().map(lookup).collect(),
            k => Ok(vec![lookup(k)?]),
        }
    }

    async fn dump_state(&self) -> Result<(Value, LogIndex)> {
        let inner = self.inner.lock();
        let state = Value::Object(inner.state.clone().into_iter().collect());
        Ok((state, inner.applied_index))
    }

    async fn find_client_requests(&self, client_id: &str) -> Result<Vec<LogIndex>> {
        let inner = self.inner.lock();
        Ok(inner
            .client_requests
            .get(client_id)
            .cloned()
            .unwrap_or_default())
    }
}
