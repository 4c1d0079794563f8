use super::*;

#[derive(Clone, Debug, Default)]
struct Ballot {
    term: Term,
    leader: Option<MemberId>,
}

/// Election state set from outside.
/// Tests and embedders decide who leads by calling `lead` and `follow`.
pub struct MemoryConstituent {
    id: MemberId,
    log: Arc<MemoryLog>,
    ballot: Mutex<Ballot>,
}

impl MemoryConstituent {
    pub fn new(id: MemberId, log: Arc<MemoryLog>) -> Self {
        Self {
            id,
            log,
            ballot: Mutex::new(Ballot::default()),
        }
    }

    /// Become the leader of `term`.
    pub fn lead(&self, term: Term) {
        let mut ballot = self.ballot.lock();
        ballot.term = term;
        ballot.leader = Some(self.id.clone());
    }

    pub fn follow(&self, term: Term, leader: MemberId) {
        let mut ballot = self.ballot.lock();
        ballot.term = term;
        ballot.leader = Some(leader);
    }
}

#[async_trait]
impl Constituent for MemoryConstituent {
    fn leader_id(&self) -> Option<MemberId> {
        self.ballot.lock().leader.clone()
    }

    fn term(&self) -> Term {
        self.ballot.lock().term
    }

    fn is_leading(&self) -> bool {
        self.ballot.lock().leader.as_ref() == Some(&self.id)
    }

    async fn check_leader(
        &self,
        term: Term,
        leader_id: &MemberId,
        prev_index: LogIndex,
        prev_term: Term,
    ) -> Result<bool> {
        {
            let mut ballot = self.ballot.lock();
            if term < ballot.term {
                return Ok(false);
            }
            if term == ballot.term {
                match &ballot.leader {
                    Some(cur) if cur != leader_id => return Ok(false),
                    Some(_) => {}
                    None => ballot.leader = Some(leader_id.clone()),
                }
            } else {
                ballot.term = term;
                ballot.leader = Some(leader_id.clone());
            }
        }

        // The compacted prefix is committed and matches any leader.
        if self.log.is_compacted(prev_index) {
            return Ok(true);
        }
        Ok(self.log.term_at(prev_index) == Some(prev_term))
    }

    async fn step_down(&self, term: Term) {
        let mut ballot = self.ballot.lock();
        if term > ballot.term {
            ballot.term = term;
            ballot.leader = None;
        } else if ballot.leader.as_ref() == Some(&self.id) {
            ballot.leader = None;
        }
    }
}
