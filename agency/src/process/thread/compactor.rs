use super::*;

pub struct Thread {
    core: Arc<Core>,
    consumer: EventConsumer<CompactionEvent>,
}

impl Thread {
    async fn run_once(&self) -> Result<()> {
        compaction::Effect { core: &self.core }.exec().await
    }

    fn do_loop(self) -> ThreadHandle {
        let fut = async move {
            loop {
                self.consumer
                    .consume_events(Duration::from_secs(10))
                    .await;
                if let Err(e) = self.run_once().await {
                    error!("compaction failed: {e:#}");
                }
            }
        };
        let hdl = tokio::spawn(fut).abort_handle();
        ThreadHandle(hdl)
    }
}

pub fn run(core: Arc<Core>, consumer: EventConsumer<CompactionEvent>) -> ThreadHandle {
    Thread { core, consumer }.do_loop()
}
