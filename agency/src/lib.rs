#![deny(unused_must_use)]

//! Replication engine and commit protocol of the Agency,
//! the replicated configuration store that holds cluster metadata.
//!
//! The election, the durable log and the wire transport are collaborators
//! plugged in through [`Constituent`], [`LogStore`] and [`Transport`].

mod error;
pub use error::Error;

/// Configuration of an agent.
pub mod config;
pub use config::AgencyConfig;

/// Implementation of `Agent`.
pub mod process;
pub use process::*;

/// Reference implementations of the collaborators.
pub mod backend;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use derive_more::{Display, FromStr};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Identifier of an agency member.
#[derive(
    Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, FromStr,
)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
