use super::*;

/// Whether enough entries were committed since the last compaction.
pub fn due(last_compaction_at: LogIndex, commit_index: LogIndex, step_size: u64) -> bool {
    commit_index >= last_compaction_at + step_size
}

pub struct Effect<'a> {
    pub core: &'a Core,
}

impl Effect<'_> {
    /// Snapshot the state at the commit index and discard the log
    /// older than `compaction_keep_size` entries before it.
    pub async fn exec(self) -> Result<()> {
        let core = self.core;
        let mut commit = core.commit.lock().await;
        let step_size = core.config.compaction_step_size;
        if !due(commit.last_compaction_at, commit.commit_index, step_size) {
            return Ok(());
        }

        let index = commit.commit_index;
        let keep = core.config.compaction_keep_size;
        core.store
            .compact(index, keep)
            .await
            .with_context(|| format!("failed to compact at {index}"))?;
        commit.last_compaction_at = index;
        info!(
            "compacted at {index}. entries up to {} are discarded",
            index.saturating_sub(keep)
        );
        Ok(())
    }
}
