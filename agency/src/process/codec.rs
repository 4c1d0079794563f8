//! An append-entries body is a JSON array.
//! The first element may be a snapshot marker `{"snapshot": {"state", "index", "term"}}`,
//! every other element is a log entry `{"index", "term", "payload", "clientId"?, "timestamp"}`.

use super::*;

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Element {
    Snapshot { snapshot: Snapshot },
    Entry(LogEntry),
}

/// Decoded append-entries body.
#[derive(Debug, Default, PartialEq)]
pub struct AppendBody {
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<LogEntry>,
}

impl AppendBody {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.entries.is_empty()
    }

    /// The highest index this body brings the receiver up to.
    pub fn last_index(&self) -> Option<LogIndex> {
        self.entries
            .last()
            .map(|e| e.index)
            .or(self.snapshot.as_ref().map(|s| s.index))
    }
}

pub fn encode_body(snapshot: Option<&Snapshot>, entries: &[LogEntry]) -> Result<Bytes> {
    let mut elems = Vec::with_capacity(entries.len() + 1);
    if let Some(snapshot) = snapshot {
        elems.push(Element::Snapshot {
            snapshot: snapshot.clone(),
        });
    }
    for e in entries {
        elems.push(Element::Entry(e.clone()));
    }
    let bin = serde_json::to_vec(&elems)?;
    Ok(bin.into())
}

/// Decode and check the shape of a body:
/// a snapshot marker may only come first and the entries must be contiguous
/// and above the snapshot.
pub fn decode_body(body: &[u8]) -> Result<AppendBody> {
    if body.is_empty() {
        return Ok(AppendBody::default());
    }
    let elems: Vec<Element> = serde_json::from_slice(body).context(Error::BadAppendEntries)?;

    let mut out = AppendBody::default();
    for (i, elem) in elems.into_iter().enumerate() {
        match elem {
            Element::Snapshot { snapshot } => {
                ensure!(i == 0, Error::BadAppendEntries);
                out.snapshot = Some(snapshot);
            }
            Element::Entry(e) => {
                let expected = match (out.entries.last(), &out.snapshot) {
                    (Some(prev), _) => Some(prev.index + 1),
                    (None, Some(snapshot)) => Some(snapshot.index + 1),
                    (None, None) => None,
                };
                if let Some(expected) = expected {
                    ensure!(e.index == expected, Error::BadAppendEntries);
                }
                ensure!(e.index > 0, Error::BadAppendEntries);
                out.entries.push(e);
            }
        }
    }
    Ok(out)
}
