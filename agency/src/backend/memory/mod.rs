mod election;
mod log;

pub use election::MemoryConstituent;
pub use log::MemoryLog;

use crate::process::*;
use crate::{Error, MemberId};

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
