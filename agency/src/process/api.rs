use super::*;

pub mod request {
    use super::*;

    /// Append-entries call. Also used as heartbeat with an empty body.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AppendEntries {
        pub term: Term,
        pub leader_id: MemberId,
        pub prev_log_index: LogIndex,
        pub prev_log_term: Term,
        pub leader_commit: LogIndex,
        /// Milliseconds since the UNIX epoch.
        pub sender_time: u64,
        /// Encoded by `codec::encode_body`.
        pub body: Bytes,
    }

    /// One operation of a write batch.
    #[derive(Clone, Debug)]
    pub struct Transaction {
        pub payload: Value,
        pub client_id: Option<String>,
    }

    impl Transaction {
        pub fn new(payload: Value) -> Self {
            Self {
                payload,
                client_id: None,
            }
        }

        pub fn with_client_id(self, client_id: impl Into<String>) -> Self {
            Self {
                client_id: Some(client_id.into()),
                ..self
            }
        }
    }
}

pub mod response {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct AppendEntries {
        pub success: bool,
        /// Term of the responder.
        pub term: Term,
    }

    #[derive(Clone, Debug)]
    pub struct Write {
        pub accepted: bool,
        /// Where to redirect if not accepted.
        pub leader_id: Option<MemberId>,
        /// Log index of each transaction in the batch.
        pub indices: Vec<LogIndex>,
    }

    impl Write {
        pub(crate) fn rejected(leader_id: Option<MemberId>) -> Self {
            Self {
                accepted: false,
                leader_id,
                indices: vec![],
            }
        }
    }

    #[derive(Clone, Debug)]
    pub struct Read {
        pub accepted: bool,
        pub leader_id: Option<MemberId>,
        pub results: Vec<Value>,
    }

    impl Read {
        pub(crate) fn rejected(leader_id: Option<MemberId>) -> Self {
            Self {
                accepted: false,
                leader_id,
                results: vec![],
            }
        }
    }
}
