use super::*;

pub struct Thread {
    core: Arc<Core>,
}

impl Thread {
    /// Send an empty append to every follower.
    /// The previous entry is the last one of the leader's log so that
    /// a follower never commits entries the leader doesn't have.
    async fn run_once(&self) -> Result<()> {
        let core = &self.core;
        let status = core.status();
        if !status.leading {
            return Ok(());
        }

        let (prev_log_index, prev_log_term, leader_commit) = {
            let commit = core.commit.lock().await;
            let last_index = core.store.last_index().await?;
            let prev = core.store.get_range(last_index, last_index).await?;
            let (index, term) = match prev.first() {
                Some(e) => (e.index, e.term),
                // Compacted away with nothing after it.
                None => match core.store.load_latest_snapshot().await? {
                    Some(s) if s.index == last_index => (s.index, s.term),
                    _ => (0, 0),
                },
            };
            (index, term, commit.commit_index)
        };

        let followers = core.progress.lock().followers();
        for follower_id in followers {
            let req = request::AppendEntries {
                term: status.term,
                leader_id: core.self_id().clone(),
                prev_log_index,
                prev_log_term,
                leader_commit,
                sender_time: now_millis(),
                body: Bytes::new(),
            };
            let core = core.clone();
            let term = status.term;
            tokio::spawn(async move {
                match core.transport.append_entries(&follower_id, req).await {
                    Ok(resp) if resp.term > term => {
                        warn!(follower = %follower_id, "heartbeat found a newer term {}. step down", resp.term);
                        core.step_down(resp.term).await;
                    }
                    Ok(_) => {
                        core.progress.lock().ack_empty(&follower_id, Instant::now());
                    }
                    Err(e) => {
                        debug!(follower = %follower_id, "heartbeat failed: {e:#}");
                    }
                }
            });
        }
        Ok(())
    }

    fn do_loop(self) -> ThreadHandle {
        let fut = async move {
            let mut interval = tokio::time::interval(self.core.config.min_ping);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!("heartbeat round failed: {e:#}");
                }
            }
        };
        let hdl = tokio::spawn(fut).abort_handle();
        ThreadHandle(hdl)
    }
}

pub fn run(core: Arc<Core>) -> ThreadHandle {
    Thread { core }.do_loop()
}
