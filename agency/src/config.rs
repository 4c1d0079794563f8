use super::*;

/// Durations are written as (fractional) seconds.
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod defaults {
    use std::time::Duration;

    pub fn min_ping() -> Duration {
        Duration::from_secs(1)
    }
    pub fn max_ping() -> Duration {
        Duration::from_secs(5)
    }
    pub fn timeout_mult() -> u32 {
        1
    }
    pub fn max_append_size() -> u64 {
        100
    }
    pub fn append_cooldown() -> Duration {
        Duration::from_secs(30)
    }
    pub fn compaction_step_size() -> u64 {
        1000
    }
    pub fn compaction_keep_size() -> u64 {
        50000
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyConfig {
    /// Identifier of this agent.
    pub id: MemberId,
    /// Active members including this agent.
    pub active: Vec<MemberId>,
    /// Heartbeat cadence. Also the tick of the driver loop.
    #[serde(with = "seconds", default = "defaults::min_ping")]
    pub min_ping: Duration,
    #[serde(with = "seconds", default = "defaults::max_ping")]
    pub max_ping: Duration,
    /// A follower counts as alive for `max_ping * timeout_mult`
    /// after its last heartbeat acknowledgment.
    #[serde(default = "defaults::timeout_mult")]
    pub timeout_mult: u32,
    /// Maximum number of log entries per append-entries call.
    #[serde(default = "defaults::max_append_size")]
    pub max_append_size: u64,
    /// No new non-empty append is sent to a follower within this period
    /// unless the previous one completed.
    #[serde(with = "seconds", default = "defaults::append_cooldown")]
    pub append_cooldown: Duration,
    /// Compaction runs every time the commit index advanced this many entries.
    #[serde(default = "defaults::compaction_step_size")]
    pub compaction_step_size: u64,
    /// Number of entries below the compaction point that stay in the log.
    #[serde(default = "defaults::compaction_keep_size")]
    pub compaction_keep_size: u64,
}

impl AgencyConfig {
    pub fn new(id: MemberId, active: Vec<MemberId>) -> Self {
        Self {
            id,
            active,
            min_ping: defaults::min_ping(),
            max_ping: defaults::max_ping(),
            timeout_mult: defaults::timeout_mult(),
            max_append_size: defaults::max_append_size(),
            append_cooldown: defaults::append_cooldown(),
            compaction_step_size: defaults::compaction_step_size(),
            compaction_keep_size: defaults::compaction_keep_size(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.active.contains(&self.id),
            "active members must contain this agent ({})",
            self.id
        );
        ensure!(!self.min_ping.is_zero(), "min_ping must be positive");
        ensure!(
            self.min_ping <= self.max_ping,
            "min_ping ({:?}) must not exceed max_ping ({:?})",
            self.min_ping,
            self.max_ping
        );
        ensure!(self.timeout_mult > 0, "timeout_mult must be positive");
        ensure!(self.max_append_size > 0, "max_append_size must be positive");
        ensure!(
            self.compaction_step_size > 0,
            "compaction_step_size must be positive"
        );
        Ok(())
    }

    /// How long a follower may stay silent before it stops counting
    /// towards the leader's majority.
    pub fn challenge_window(&self) -> Duration {
        self.max_ping * self.timeout_mult
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s).context("failed to parse agency config")?;
        config.validate()?;
        Ok(config)
    }
}
