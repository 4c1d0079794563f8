use agency::backend::memory::MemoryLog;
use agency::*;
use anyhow::{bail, ensure, Result};
use env::Env;
use std::sync::Arc;
use std::time::Duration;

pub use env::member_id;

pub struct Builder {
    with_logging: bool,
    configure: Box<dyn Fn(&mut AgencyConfig) + Send + Sync>,
}

impl Builder {
    fn new() -> Self {
        Self {
            with_logging: true,
            configure: Box::new(|_: &mut AgencyConfig| {}),
        }
    }

    pub fn with_logging(self, b: bool) -> Self {
        Self {
            with_logging: b,
            ..self
        }
    }

    /// Change the config of every agent.
    pub fn configure(self, f: impl Fn(&mut AgencyConfig) + Send + Sync + 'static) -> Self {
        Self {
            configure: Box::new(f),
            ..self
        }
    }

    pub async fn build(self, n: u8) -> Result<Cluster> {
        ensure!(n > 0);
        let members: Vec<u8> = (0..n).collect();
        let mut env = Env::new(self.with_logging);
        for &id in &members {
            let mut config = Env::config(id, &members);
            (self.configure)(&mut config);
            env.add_node(id, config).await?;
        }
        Ok(Cluster {
            env,
            members,
            configure: self.configure,
        })
    }
}

pub struct Cluster {
    env: Env,
    members: Vec<u8>,
    configure: Box<dyn Fn(&mut AgencyConfig) + Send + Sync>,
}

impl Cluster {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Create `n` agents connected to each other. Nobody leads yet.
    pub async fn new(n: u8) -> Result<Self> {
        Self::builder().build(n).await
    }

    pub fn env(&mut self) -> &mut Env {
        &mut self.env
    }

    pub fn agent(&self, id: u8) -> Arc<Agent> {
        self.env.node(id).agent.clone()
    }

    pub fn log(&self, id: u8) -> Arc<MemoryLog> {
        self.env.node(id).log.clone()
    }

    /// Elect `id` and wait until it is in office.
    pub async fn elect(&self, id: u8, term: Term) -> Result<()> {
        self.env.elect(id, term);
        let agent = self.agent(id);
        // The first write brings it into office.
        let resp = agent.write(vec![]).await?;
        ensure!(resp.accepted, "{} did not take office", member_id(id));
        Ok(())
    }

    /// Write `{key: value}` through `id` and return its index.
    pub async fn put(&self, id: u8, key: &str, value: serde_json::Value) -> Result<LogIndex> {
        let mut payload = serde_json::Map::new();
        payload.insert(key.to_string(), value);
        let resp = self
            .agent(id)
            .write(vec![request::Transaction::new(payload.into())])
            .await?;
        ensure!(resp.accepted, "write rejected (leader={:?})", resp.leader_id);
        Ok(resp.indices[0])
    }

    /// Wait until the agent `id` has committed `index`. Works for followers too.
    pub async fn wait_commit(&self, id: u8, index: LogIndex, timeout: Duration) -> Result<()> {
        let agent = self.agent(id);
        let deadline = tokio::time::Instant::now() + timeout;
        while agent.last_committed_index() < index {
            if tokio::time::Instant::now() > deadline {
                bail!(
                    "{} stuck at commit_index={} (waiting for {index})",
                    member_id(id),
                    agent.last_committed_index()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Restart `id` on its own log.
    pub async fn restart(&mut self, id: u8) -> Result<()> {
        let Some(log) = self.env.remove_node(id).await else {
            bail!("{} is not running", member_id(id));
        };
        let mut config = Env::config(id, &self.members);
        (self.configure)(&mut config);
        self.env.add_node_with(id, config, log).await
    }
}
