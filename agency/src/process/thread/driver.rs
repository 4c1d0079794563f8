use super::*;

pub struct Thread {
    core: Arc<Core>,
    consumer: EventConsumer<DriverEvent>,
}

impl Thread {
    async fn run_once(&self) -> Result<()> {
        let core = &self.core;

        // Expired polls are answered in any role.
        let commit_index = core.status().commit_index;
        let (n, n_pending) = {
            let mut polls = core.polls.lock();
            let n = polls.expire(Instant::now(), commit_index);
            (n, polls.n_pending())
        };
        if n > 0 {
            debug!("{n} polls expired at commit_index={commit_index}. {n_pending} pending");
        }

        if !core.sync_leadership().await? {
            return Ok(());
        }
        core.ensure_unchallenged().await?;

        replication::Effect { core }.exec().await?;
        commit::Effect { core }.exec().await?;
        Ok(())
    }

    fn do_loop(self) -> ThreadHandle {
        let fut = async move {
            loop {
                self.consumer
                    .consume_events(self.core.config.min_ping)
                    .await;
                if let Err(e) = self.run_once().await {
                    match e.downcast_ref::<Error>() {
                        Some(Error::LeadershipChallenged | Error::NotLeader { .. }) => {
                            debug!("driver: {e}");
                        }
                        _ => error!("driver failed: {e:#}"),
                    }
                }
            }
        };
        let hdl = tokio::spawn(fut).abort_handle();
        ThreadHandle(hdl)
    }
}

pub fn run(core: Arc<Core>, consumer: EventConsumer<DriverEvent>) -> ThreadHandle {
    Thread { core, consumer }.do_loop()
}
