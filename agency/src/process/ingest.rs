use super::*;

/// Follower side of append-entries.
pub struct Effect<'a> {
    pub core: &'a Core,
}

impl Effect<'_> {
    pub async fn exec(self, req: request::AppendEntries) -> Result<response::AppendEntries> {
        let core = self.core;
        ensure!(core.ready.load(Ordering::SeqCst), Error::NotReady);

        let body = match codec::decode_body(&req.body) {
            Ok(body) => body,
            Err(e) => {
                error!(leader = %req.leader_id, "malformed append entries: {e:#}");
                return Err(e);
            }
        };

        // A snapshot replaces the local log so there is nothing to match it against.
        let (prev_index, prev_term) = if body.snapshot.is_some() {
            (0, 0)
        } else {
            (req.prev_log_index, req.prev_log_term)
        };
        let accepted = core
            .constituent
            .check_leader(req.term, &req.leader_id, prev_index, prev_term)
            .await?;
        let term = core.constituent.term();
        if !accepted {
            debug!(leader = %req.leader_id, "append rejected at term={term} (prev={prev_index}@{prev_term})");
            return Ok(response::AppendEntries {
                success: false,
                term,
            });
        }

        // The call may have demoted a leader of an older term.
        core.sync_leadership().await?;

        let mut commit = core.commit.lock().await;

        if body.is_empty() {
            let last_index = core.store.last_index().await?;
            // Nothing was matched against a log that starts from scratch.
            if req.prev_log_index > 0 {
                let new_commit_index = LogIndex::min(req.leader_commit, last_index);
                commit::advance(core, &mut commit, new_commit_index, req.term).await?;
            }
            return Ok(response::AppendEntries {
                success: last_index > 0,
                term,
            });
        }

        let last_supplied = body.last_index().unwrap_or(0);

        // The committed prefix is the same everywhere so a snapshot
        // behind the local commit index brings nothing new.
        let snapshot = body
            .snapshot
            .filter(|s| s.index > commit.commit_index);
        if let Some(snapshot) = snapshot {
            let index = snapshot.index;
            info!(leader = %req.leader_id, "install snapshot@{index}");
            core.store
                .install_snapshot(snapshot)
                .await
                .with_context(|| format!("failed to install snapshot@{index}"))?;
            commit.commit_index = index;
            commit.last_compaction_at = index;
            core.status_tx.send_modify(|s| s.commit_index = index);
        }

        if !body.entries.is_empty() {
            let stored = core.store.append_entries(body.entries).await?;
            if stored < last_supplied {
                warn!("stored entries up to {stored} out of {last_supplied}");
                // The stored prefix matched the leader all the same.
                let new_commit_index = LogIndex::min(req.leader_commit, stored);
                commit::advance(core, &mut commit, new_commit_index, req.term).await?;
                return Ok(response::AppendEntries {
                    success: false,
                    term,
                });
            }
        }

        // Only what this call proved to match the leader may be committed.
        let new_commit_index = LogIndex::min(req.leader_commit, last_supplied);
        commit::advance(core, &mut commit, new_commit_index, req.term).await?;

        Ok(response::AppendEntries {
            success: true,
            term,
        })
    }
}
