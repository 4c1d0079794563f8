use super::*;

/// The highest index acknowledged by a quorum of `n_members`.
/// `acked` holds one index per member that answered, self included.
pub fn quorum_index(mut acked: Vec<LogIndex>, n_members: usize) -> Option<LogIndex> {
    let quorum = n_members / 2 + 1;
    if acked.len() < quorum {
        return None;
    }
    acked.sort_unstable();
    Some(acked[acked.len() - quorum])
}

/// Leader side. Move the commit index to what a quorum holds.
pub struct Effect<'a> {
    pub core: &'a Core,
}

impl Effect<'_> {
    pub async fn exec(self) -> Result<()> {
        let core = self.core;
        let mut commit = core.commit.lock().await;
        let status = core.status();
        ensure!(status.leading, core.not_leader());

        let (mut acked, n_members) = {
            let progress = core.progress.lock();
            (progress.acked_indices(), progress.n_members())
        };
        acked.push(core.store.last_index().await?);

        let Some(candidate) = quorum_index(acked, n_members) else {
            return Ok(());
        };
        if candidate <= commit.commit_index {
            return Ok(());
        }

        // Entries of earlier terms are committed only indirectly.
        let entries = core.store.get_range(candidate, candidate).await?;
        let entry = entries.first().context(Error::EntryNotFound(candidate))?;
        if entry.term != status.term {
            debug!(
                "quorum holds {candidate} of term {} but current term is {}",
                entry.term, status.term
            );
            return Ok(());
        }

        advance(core, &mut commit, candidate, status.term).await?;
        Ok(())
    }
}

/// Apply `(commit_index, new_commit_index]` to the state machine and publish
/// the new commit index batch by batch.
/// Returns false if there was nothing to do.
pub(super) async fn advance(
    core: &Core,
    commit: &mut CommitState,
    new_commit_index: LogIndex,
    term: Term,
) -> Result<bool> {
    if new_commit_index <= commit.commit_index {
        return Ok(false);
    }
    let old_commit_index = commit.commit_index;
    let batch_size = core.config.max_append_size;

    while commit.commit_index < new_commit_index {
        let from = commit.commit_index + 1;
        let to = LogIndex::min(new_commit_index, from + batch_size - 1);
        let entries = core.store.get_range(from, to).await?;

        let contiguous = entries.len() as u64 == to - from + 1
            && entries
                .iter()
                .zip(from..)
                .all(|(e, index)| e.index == index);
        ensure!(contiguous, Error::EntryNotFound(from));

        core.store.apply_entries(&entries, to, term).await?;
        commit.commit_index = to;
        core.status_tx.send_modify(|s| s.commit_index = to);
        // No receiver is fine.
        core.applied_tx.send(Arc::new(entries)).ok();
    }
    debug!("commit_index {old_commit_index} -> {new_commit_index}");

    fulfil_polls(core, commit.commit_index).await?;

    if compaction::due(
        commit.last_compaction_at,
        commit.commit_index,
        core.config.compaction_step_size,
    ) {
        core.compaction_evt_tx.push_event(CompactionEvent);
    }
    Ok(true)
}

/// Hand the newly committed entries to the polls waiting for them.
async fn fulfil_polls(core: &Core, commit_index: LogIndex) -> Result<()> {
    let Some(lowest) = core.polls.lock().lowest_target() else {
        return Ok(());
    };
    if lowest > commit_index {
        return Ok(());
    }
    let entries = core.store.get_range(lowest, commit_index).await?;
    let n = core.polls.lock().resolve(commit_index, &entries);
    debug!("fulfilled {n} polls at commit_index={commit_index}");
    Ok(())
}
