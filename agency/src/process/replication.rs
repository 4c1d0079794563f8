use super::*;

/// What to send to a follower in this round.
/// Ranges are inclusive and `[from, to]` is empty when `to < from`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationPlan {
    /// Entries `[from, to]` following the entry at `prev_index`.
    SendRange {
        prev_index: LogIndex,
        from: LogIndex,
        to: LogIndex,
    },
    /// The snapshot taken at `snapshot_index` followed by entries `[from, to]`.
    SendSnapshotThenRange {
        snapshot_index: LogIndex,
        from: LogIndex,
        to: LogIndex,
    },
}

/// Decide what a follower that has `[1, last_confirmed]` needs next.
///
/// The entry at `last_confirmed` must still be in the log because its term is sent
/// as `prev_log_term`. If compaction discarded it, the snapshot taken at
/// `last_compaction_at` takes its role and the trailing log starts right after it.
/// Returns `None` if the follower is up to date.
pub fn plan_replication(
    last_confirmed: LogIndex,
    first_index: LogIndex,
    last_index: LogIndex,
    last_compaction_at: LogIndex,
    max_append_size: u64,
) -> Option<ReplicationPlan> {
    if last_index <= last_confirmed {
        return None;
    }
    let window_end = |from: LogIndex| LogIndex::min(last_index, from + max_append_size - 1);

    // Index 0 is the beginning of a log that has never been compacted.
    let prev_retained = last_confirmed >= first_index || (last_confirmed == 0 && first_index <= 1);
    if prev_retained {
        let from = last_confirmed + 1;
        Some(ReplicationPlan::SendRange {
            prev_index: last_confirmed,
            from,
            to: window_end(from),
        })
    } else {
        let from = last_compaction_at + 1;
        Some(ReplicationPlan::SendSnapshotThenRange {
            snapshot_index: last_compaction_at,
            from,
            to: window_end(from),
        })
    }
}

/// State shared by one replication round.
struct Round {
    term: Term,
    leader_commit: LogIndex,
    last_compaction_at: LogIndex,
    first_index: LogIndex,
    last_index: LogIndex,
}

pub struct Effect<'a> {
    pub core: &'a Arc<Core>,
}

impl Effect<'_> {
    fn store(&self) -> &Arc<dyn LogStore> {
        &self.core.store
    }

    /// Send the next batch of entries to every follower that needs one.
    /// A challenged leadership aborts the whole round.
    pub async fn exec(self) -> Result<()> {
        let round = {
            let commit = self.core.commit.lock().await;
            let status = self.core.status();
            ensure!(status.leading, self.core.not_leader());
            Round {
                term: status.term,
                leader_commit: commit.commit_index,
                last_compaction_at: commit.last_compaction_at,
                first_index: self.store().first_index().await?,
                last_index: self.store().last_index().await?,
            }
        };

        let followers = self.core.progress.lock().followers();
        for follower_id in followers {
            if let Err(e) = self.replicate(&follower_id, &round).await {
                if let Some(Error::LeadershipChallenged) = e.downcast_ref::<Error>() {
                    return Err(e);
                }
                warn!(follower = %follower_id, "replication round skipped: {e:#}");
            }
        }
        Ok(())
    }

    async fn replicate(&self, follower_id: &MemberId, round: &Round) -> Result<()> {
        let now = Instant::now();
        let Some((last_confirmed, window)) =
            self.core.progress.lock().ready_to_send(follower_id, now)
        else {
            return Ok(());
        };
        let Some(plan) = plan_replication(
            last_confirmed,
            round.first_index,
            round.last_index,
            round.last_compaction_at,
            window,
        ) else {
            return Ok(());
        };

        let (req, highest) = match plan {
            ReplicationPlan::SendRange {
                prev_index,
                from,
                to,
            } => {
                let Some((prev_term, entries)) = self.fetch_window(prev_index, from, to).await? else {
                    return Ok(());
                };
                let body = codec::encode_body(None, &entries)?;
                (self.request(round, prev_index, prev_term, body), to)
            }
            ReplicationPlan::SendSnapshotThenRange {
                snapshot_index,
                from,
                to,
            } => {
                warn!(
                    follower = %follower_id,
                    "follower is behind the compaction (last_confirmed={last_confirmed}, first_index={}). send snapshot@{snapshot_index}",
                    round.first_index,
                );
                let snapshot = match self.store().load_latest_snapshot().await {
                    Ok(Some(snapshot)) if snapshot.index == snapshot_index => snapshot,
                    Ok(_) => {
                        warn!("{}", Error::SnapshotUnavailable(snapshot_index));
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("{}: {e:#}", Error::SnapshotUnavailable(snapshot_index));
                        return Ok(());
                    }
                };
                let entries = if from <= to {
                    self.store().get_range(from, to).await?
                } else {
                    vec![]
                };
                let highest = entries.last().map(|e| e.index).unwrap_or(snapshot.index);
                let body = codec::encode_body(Some(&snapshot), &entries)?;
                (self.request(round, snapshot.index, snapshot.term, body), highest)
            }
        };

        // Leadership may have been lost while reading the log.
        self.core.ensure_unchallenged().await?;

        self.core
            .progress
            .lock()
            .mark_sent(follower_id, now, self.core.config.append_cooldown)?;

        let core = self.core.clone();
        let follower_id = follower_id.clone();
        let term = round.term;
        tokio::spawn(async move {
            let resp = core.transport.append_entries(&follower_id, req).await;
            on_response(&core, &follower_id, term, highest, resp).await;
        });

        Ok(())
    }

    /// Fetch `[prev_index, to]` (`[from, to]` if `prev_index` is 0)
    /// and split it into the previous term and the entries to send.
    async fn fetch_window(
        &self,
        prev_index: LogIndex,
        from: LogIndex,
        to: LogIndex,
    ) -> Result<Option<(Term, Vec<LogEntry>)>> {
        let start = if prev_index == 0 { from } else { prev_index };
        let mut window = self.store().get_range(start, to).await?;

        let complete = window.first().map(|e| e.index) == Some(start)
            && window.last().map(|e| e.index) == Some(to);
        if !complete {
            // A compaction that ran after the round started is not a bug.
            let first_index = self.store().first_index().await?;
            if first_index > start {
                debug!("window [{start}, {to}] was compacted away (first_index={first_index})");
                return Ok(None);
            }
            error!("{}", Error::EntryWindowEmpty(start, to));
            debug_assert!(complete, "log store returned an incomplete window");
            bail!(Error::EntryWindowEmpty(start, to));
        }

        if prev_index == 0 {
            return Ok(Some((0, window)));
        }
        let prev = window.remove(0);
        Ok(Some((prev.term, window)))
    }

    fn request(
        &self,
        round: &Round,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        body: Bytes,
    ) -> request::AppendEntries {
        request::AppendEntries {
            term: round.term,
            leader_id: self.core.self_id().clone(),
            prev_log_index,
            prev_log_term,
            leader_commit: round.leader_commit,
            sender_time: now_millis(),
            body,
        }
    }
}

/// Account a completed append in the progress of the follower.
async fn on_response(
    core: &Core,
    follower_id: &MemberId,
    term: Term,
    highest: LogIndex,
    resp: Result<response::AppendEntries>,
) {
    let now = Instant::now();
    match resp {
        Ok(resp) if resp.term > term => {
            warn!(follower = %follower_id, "found a newer term {} > {term}. step down", resp.term);
            core.step_down(resp.term).await;
        }
        Ok(resp) => {
            // Acknowledgments from an earlier term say nothing about the current log.
            let status = core.status();
            if !status.leading || status.term != term {
                return;
            }
            if resp.success {
                core.progress.lock().ack(follower_id, highest, now);
                core.driver_evt_tx.push_event(DriverEvent);
            } else {
                warn!(follower = %follower_id, "append rejected. replicate from the beginning with a narrower window");
                core.progress.lock().reject(follower_id, now);
            }
        }
        Err(e) => {
            debug!(follower = %follower_id, "append failed: {e:#}");
            core.progress
                .lock()
                .back_off(follower_id, now + core.config.max_ping);
        }
    }
}
