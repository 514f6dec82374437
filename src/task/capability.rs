//! Execution capabilities a task requires from its delegate
//!
//! Selector capabilities route the task by label. Every other kind names a
//! resource the delegate must be able to reach, and contributes a criteria
//! string used as the whitelist key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A structured requirement attached to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionCapability {
    /// Delegate must carry every listed selector
    Selector {
        selectors: Vec<String>,
        /// Where the selectors were configured, shown in audit messages
        #[serde(default)]
        origin: Option<String>,
    },
    /// Delegate must be able to reach an HTTP endpoint
    Http { url: String },
    /// Delegate must be able to open a socket to host:port
    SocketConnectivity { host: String, port: u16 },
}

impl ExecutionCapability {
    pub fn selector<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecutionCapability::Selector {
            selectors: selectors.into_iter().map(Into::into).collect(),
            origin: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionCapability::Selector { .. } => "selector",
            ExecutionCapability::Http { .. } => "http",
            ExecutionCapability::SocketConnectivity { .. } => "socket_connectivity",
        }
    }

    /// Whitelist fingerprint; selector requirements have none
    pub fn criteria(&self) -> Option<String> {
        match self {
            ExecutionCapability::Selector { .. } => None,
            ExecutionCapability::Http { url } => Some(url.trim().to_string()),
            ExecutionCapability::SocketConnectivity { host, port } => {
                Some(format!("{}:{}", host.trim(), port))
            }
        }
        .filter(|c| !c.is_empty())
    }
}

/// Trim and lowercase a selector; blank selectors are dropped
pub fn normalize_selector(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Normalized, deduplicated set of selectors
pub fn trimmed_lowercase_set<'a, I>(selectors: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    selectors
        .into_iter()
        .filter_map(|s| normalize_selector(s))
        .collect()
}
