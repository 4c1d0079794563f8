use super::*;

/// What the leader knows about one follower.
#[derive(Clone, Debug)]
pub struct FollowerState {
    pub last_acked_time: Instant,
    /// The follower has `[1, last_acked_index]` in its log.
    pub last_acked_index: LogIndex,
    pub last_sent_time: Option<Instant>,
    /// No new non-empty append before this time.
    pub earliest_next_contact: Instant,
    /// Heartbeat liveness. Independent from log progress.
    pub last_empty_acked_time: Instant,
    /// Entries per append. Narrowed while the follower fails to take them all.
    pub window: u64,
}

impl FollowerState {
    fn new(now: Instant, window: u64) -> Self {
        Self {
            last_acked_time: now,
            last_acked_index: 0,
            last_sent_time: None,
            earliest_next_contact: now,
            last_empty_acked_time: now,
            window,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FollowerReport {
    pub member: MemberId,
    pub last_acked_index: LogIndex,
    pub since_last_ack: Duration,
    /// `None` if nothing was sent in this term.
    pub since_last_send: Option<Duration>,
}

/// Progress of every active member other than self.
pub struct Progress {
    self_id: MemberId,
    followers: HashMap<MemberId, FollowerState>,
    max_window: u64,
}

impl Progress {
    pub fn new(self_id: MemberId, active: &[MemberId], max_window: u64, now: Instant) -> Self {
        let mut out = Self {
            self_id,
            followers: HashMap::new(),
            max_window,
        };
        out.sync_membership(active, now);
        out
    }

    /// Add states for new members and drop the ones of departed members.
    pub fn sync_membership(&mut self, active: &[MemberId], now: Instant) {
        self.followers
            .retain(|id, _| active.contains(id));
        for id in active {
            if *id != self.self_id && !self.followers.contains_key(id) {
                self.followers
                    .insert(id.clone(), FollowerState::new(now, self.max_window));
            }
        }
    }

    /// Forget everything learned in the previous term.
    /// Heartbeats count as fresh so that a new leader is not challenged right away.
    pub fn reset(&mut self, now: Instant) {
        for st in self.followers.values_mut() {
            *st = FollowerState::new(now, self.max_window);
        }
    }

    /// Number of active members including self.
    pub fn n_members(&self) -> usize {
        self.followers.len() + 1
    }

    pub fn followers(&self) -> Vec<MemberId> {
        let mut out: Vec<MemberId> = self.followers.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn get(&self, id: &MemberId) -> Option<&FollowerState> {
        self.followers.get(id)
    }

    /// `last_acked_index` and the window of the follower
    /// if the throttle window has elapsed.
    pub fn ready_to_send(&self, id: &MemberId, now: Instant) -> Option<(LogIndex, u64)> {
        let st = self.followers.get(id)?;
        if now < st.earliest_next_contact {
            return None;
        }
        Some((st.last_acked_index, st.window))
    }

    /// Called before dispatching a non-empty append.
    /// The cooldown keeps a hung call from piling up duplicates.
    pub fn mark_sent(&mut self, id: &MemberId, now: Instant, cooldown: Duration) -> Result<()> {
        let st = self
            .followers
            .get_mut(id)
            .context(Error::PeerNotFound(id.clone()))?;
        st.last_sent_time = Some(now);
        st.earliest_next_contact = now + cooldown;
        Ok(())
    }

    pub fn ack(&mut self, id: &MemberId, index: LogIndex, now: Instant) {
        if let Some(st) = self.followers.get_mut(id) {
            st.last_acked_index = LogIndex::max(st.last_acked_index, index);
            st.last_acked_time = now;
            st.earliest_next_contact = now;
            st.window = self.max_window;
        }
    }

    /// The follower rejected an append. Replication restarts from the beginning
    /// with half the window.
    pub fn reject(&mut self, id: &MemberId, now: Instant) {
        if let Some(st) = self.followers.get_mut(id) {
            st.last_acked_index = 0;
            st.earliest_next_contact = now;
            st.window = u64::max(1, st.window / 2);
        }
    }

    pub fn back_off(&mut self, id: &MemberId, until: Instant) {
        if let Some(st) = self.followers.get_mut(id) {
            st.earliest_next_contact = until;
        }
    }

    pub fn ack_empty(&mut self, id: &MemberId, now: Instant) {
        if let Some(st) = self.followers.get_mut(id) {
            st.last_empty_acked_time = now;
        }
    }

    pub fn acked_indices(&self) -> Vec<LogIndex> {
        self.followers.values().map(|st| st.last_acked_index).collect()
    }

    /// Whether fewer than a majority of the other members acknowledged
    /// a heartbeat within `window`.
    pub fn challenged(&self, now: Instant, window: Duration) -> bool {
        let good = self
            .followers
            .values()
            .filter(|st| now.saturating_duration_since(st.last_empty_acked_time) < window)
            .count();
        good < self.n_members() / 2
    }

    pub fn report(&self, now: Instant) -> Vec<FollowerReport> {
        self.followers()
            .into_iter()
            .filter_map(|id| {
                let st = self.get(&id)?.clone();
                Some(FollowerReport {
                    member: id,
                    last_acked_index: st.last_acked_index,
                    since_last_ack: now.saturating_duration_since(st.last_acked_time),
                    since_last_send: st
                        .last_sent_time
                        .map(|t| now.saturating_duration_since(t)),
                })
            })
            .collect()
    }
}
