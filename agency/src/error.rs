use super::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not leader (leader={leader:?})")]
    NotLeader { leader: Option<MemberId> },
    #[error("leadership challenged. a majority stopped acknowledging heartbeats")]
    LeadershipChallenged,
    #[error("agent is not ready")]
    NotReady,
    #[error("append entries body is malformed")]
    BadAppendEntries,
    #[error("no snapshot to cover the compacted log (compaction_index={0})")]
    SnapshotUnavailable(LogIndex),
    #[error("entry not found at index {0}")]
    EntryNotFound(LogIndex),
    #[error("fetched entry window [{0}, {1}] is empty")]
    EntryWindowEmpty(LogIndex, LogIndex),
    #[error("peer (member_id={0}) not found")]
    PeerNotFound(MemberId),
}
