use agency::backend::memory::{MemoryConstituent, MemoryLog};
use agency::*;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;
use tracing::info;

static INIT: Once = Once::new();

pub fn member_id(id: u8) -> MemberId {
    MemberId::new(format!("agent-{id}"))
}

/// Routes append-entries calls between agents of the same process.
#[derive(Default)]
struct Network {
    agents: RwLock<HashMap<MemberId, Weak<Agent>>>,
    down: RwLock<HashSet<MemberId>>,
}

impl Network {
    fn connect(&self, from: &MemberId, to: &MemberId) -> Result<Arc<Agent>> {
        let down = self.down.read();
        anyhow::ensure!(!down.contains(from), "{from} is disconnected");
        anyhow::ensure!(!down.contains(to), "{to} is disconnected");
        self.agents
            .read()
            .get(to)
            .and_then(Weak::upgrade)
            .with_context(|| format!("{to} is not running"))
    }
}

struct Link {
    from: MemberId,
    network: Arc<Network>,
}

#[async_trait::async_trait]
impl Transport for Link {
    async fn append_entries(
        &self,
        to: &MemberId,
        req: request::AppendEntries,
    ) -> Result<response::AppendEntries> {
        let agent = self.network.connect(&self.from, to)?;
        let resp = agent.receive_append_entries(req).await?;
        // The response is lost if the link broke meanwhile.
        self.network.connect(to, &self.from)?;
        Ok(resp)
    }
}

pub struct Node {
    pub agent: Arc<Agent>,
    pub log: Arc<MemoryLog>,
    pub constituent: Arc<MemoryConstituent>,
}

pub struct Env {
    nodes: HashMap<u8, Node>,
    network: Arc<Network>,
}

impl Env {
    pub fn new(with_logging: bool) -> Self {
        INIT.call_once(|| {
            if with_logging {
                let format = tracing_subscriber::fmt::format()
                    .with_target(false)
                    .with_thread_names(true)
                    .compact();
                tracing_subscriber::fmt().event_format(format).init();
            }
        });
        Self {
            nodes: HashMap::new(),
            network: Arc::new(Network::default()),
        }
    }

    /// Config with short intervals so that tests run quickly.
    pub fn config(id: u8, members: &[u8]) -> AgencyConfig {
        let active = members.iter().map(|&i| member_id(i)).collect();
        let mut config = AgencyConfig::new(member_id(id), active);
        config.min_ping = Duration::from_millis(20);
        config.max_ping = Duration::from_millis(100);
        config.timeout_mult = 2;
        config.append_cooldown = Duration::from_secs(1);
        config
    }

    /// Start an agent on `log`. A restarted node keeps its log.
    pub async fn add_node_with(
        &mut self,
        id: u8,
        config: AgencyConfig,
        log: Arc<MemoryLog>,
    ) -> Result<()> {
        info!("add (id={id})");
        let member = member_id(id);
        let constituent = Arc::new(MemoryConstituent::new(member.clone(), log.clone()));
        let link = Link {
            from: member.clone(),
            network: self.network.clone(),
        };
        let agent = Agent::new(config, constituent.clone(), log.clone(), Arc::new(link)).await?;
        let agent = Arc::new(agent);
        self.network
            .agents
            .write()
            .insert(member, Arc::downgrade(&agent));
        self.nodes.insert(
            id,
            Node {
                agent,
                log,
                constituent,
            },
        );
        Ok(())
    }

    pub async fn add_node(&mut self, id: u8, config: AgencyConfig) -> Result<()> {
        self.add_node_with(id, config, Arc::new(MemoryLog::new()))
            .await
    }

    /// Stop the agent. Its log is returned for a restart.
    pub async fn remove_node(&mut self, id: u8) -> Option<Arc<MemoryLog>> {
        let node = self.nodes.remove(&id)?;
        info!("remove (id={id})");
        node.agent.shutdown().await;
        self.network.agents.write().remove(&member_id(id));
        Some(node.log)
    }

    pub fn node(&self, id: u8) -> &Node {
        &self.nodes[&id]
    }

    /// Make `id` the leader of `term` and everyone else its follower.
    pub fn elect(&self, id: u8, term: u64) {
        for (&i, node) in &self.nodes {
            if i == id {
                node.constituent.lead(term);
            } else {
                node.constituent.follow(term, member_id(id));
            }
        }
        info!("elected {} at term={term}", member_id(id));
    }

    pub fn disconnect(&self, id: u8) {
        self.network.down.write().insert(member_id(id));
    }

    pub fn connect(&self, id: u8) {
        self.network.down.write().remove(&member_id(id));
    }
}
