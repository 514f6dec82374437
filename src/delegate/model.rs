//! Delegate model
//!
//! A delegate is a worker agent that polls for tasks. Its scopes and
//! selectors decide which tasks it may serve.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::task::capability::normalize_selector;
use crate::task::model::context_keys;

/// Lifecycle status of a delegate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateStatus {
    Enabled,
    WaitingForApproval,
    Disabled,
    /// Soft-deleted; never purged
    Deleted,
}

impl DelegateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegateStatus::Enabled => "enabled",
            DelegateStatus::WaitingForApproval => "waiting_for_approval",
            DelegateStatus::Disabled => "disabled",
            DelegateStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for DelegateStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(DelegateStatus::Enabled),
            "waiting_for_approval" => Ok(DelegateStatus::WaitingForApproval),
            "disabled" => Ok(DelegateStatus::Disabled),
            "deleted" => Ok(DelegateStatus::Deleted),
            _ => Err(format!("Invalid delegate status: {}", s)),
        }
    }
}

/// Liveness classification used when listing delegates for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelegateActivity {
    Active,
    Disconnected,
    WaitingForApproval,
    Other,
}

/// A predicate over task context restricting which tasks a delegate serves.
///
/// An empty dimension does not constrain. A scope matches a task when every
/// non-empty dimension contains the task's value for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateScope {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub environment_types: BTreeSet<String>,
    #[serde(default)]
    pub services: BTreeSet<String>,
    #[serde(default)]
    pub infrastructure_definitions: BTreeSet<String>,
    #[serde(default)]
    pub applications: BTreeSet<String>,
    #[serde(default)]
    pub environments: BTreeSet<String>,
}

impl DelegateScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_environment_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environment_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_infrastructure_definitions<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.infrastructure_definitions = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_applications<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.applications = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_environments<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = ids.into_iter().map(Into::into).collect();
        self
    }

    /// A scope must constrain at least one dimension
    pub fn is_valid(&self) -> bool {
        !(self.environment_types.is_empty()
            && self.services.is_empty()
            && self.infrastructure_definitions.is_empty()
            && self.applications.is_empty()
            && self.environments.is_empty())
    }

    /// Check whether every constrained dimension matches the task context
    pub fn matches(&self, context: &BTreeMap<String, String>) -> bool {
        dimension_matches(&self.environment_types, context.get(context_keys::ENV_TYPE))
            && dimension_matches(&self.services, context.get(context_keys::SERVICE_ID))
            && dimension_matches(
                &self.infrastructure_definitions,
                context.get(context_keys::INFRA_DEFINITION_ID),
            )
            && dimension_matches(&self.applications, context.get(context_keys::APP_ID))
            && dimension_matches(&self.environments, context.get(context_keys::ENV_ID))
    }
}

fn dimension_matches(allowed: &BTreeSet<String>, value: Option<&String>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match value {
        Some(v) if !v.trim().is_empty() => allowed.contains(v),
        _ => false,
    }
}

/// Registration request sent by a delegate agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDelegate {
    pub host_name: String,
    #[serde(default)]
    pub delegate_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub declared_selectors: Vec<String>,
    #[serde(default)]
    pub include_scopes: Vec<Option<DelegateScope>>,
    #[serde(default)]
    pub exclude_scopes: Vec<Option<DelegateScope>>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub version: String,
    /// Initial status; defaults to enabled
    #[serde(default)]
    pub status: Option<DelegateStatus>,
}

/// A registered delegate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegate {
    pub id: Uuid,
    pub account_id: String,
    pub host_name: String,
    pub delegate_name: String,
    pub status: DelegateStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Static tags configured by the operator
    pub tags: Vec<String>,
    /// Selectors the delegate (or its profile) declares at runtime
    pub declared_selectors: Vec<String>,
    /// `None` entries are wildcards and never constrain
    pub include_scopes: Vec<Option<DelegateScope>>,
    pub exclude_scopes: Vec<Option<DelegateScope>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

impl Delegate {
    pub fn new(account_id: impl Into<String>, request: NewDelegate, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            host_name: request.host_name,
            delegate_name: request.delegate_name,
            status: request.status.unwrap_or(DelegateStatus::Enabled),
            last_heartbeat: now,
            tags: request.tags,
            declared_selectors: request.declared_selectors,
            include_scopes: request.include_scopes,
            exclude_scopes: request.exclude_scopes,
            profile_id: request.profile_id,
            version: request.version,
            created_at: now,
        }
    }

    /// Enabled and heartbeating within `max_heartbeat_age`
    pub fn is_active(&self, now: DateTime<Utc>, max_heartbeat_age: Duration) -> bool {
        self.activity(now, max_heartbeat_age) == DelegateActivity::Active
    }

    pub fn activity(&self, now: DateTime<Utc>, max_heartbeat_age: Duration) -> DelegateActivity {
        match self.status {
            DelegateStatus::Enabled if now - self.last_heartbeat <= max_heartbeat_age => {
                DelegateActivity::Active
            }
            DelegateStatus::Enabled => DelegateActivity::Disconnected,
            DelegateStatus::WaitingForApproval => DelegateActivity::WaitingForApproval,
            DelegateStatus::Disabled | DelegateStatus::Deleted => DelegateActivity::Other,
        }
    }

    /// Static tags and declared selectors, trimmed and lowercased
    pub fn explicit_selectors(&self) -> BTreeSet<String> {
        self.tags
            .iter()
            .chain(self.declared_selectors.iter())
            .filter_map(|s| normalize_selector(s))
            .collect()
    }

    /// Name and host name, which also satisfy selectors
    pub fn implicit_selectors(&self) -> BTreeSet<String> {
        [&self.delegate_name, &self.host_name]
            .into_iter()
            .filter_map(|s| normalize_selector(s))
            .collect()
    }

    pub fn include_scopes(&self) -> impl Iterator<Item = &DelegateScope> {
        self.include_scopes.iter().flatten()
    }

    pub fn exclude_scopes(&self) -> impl Iterator<Item = &DelegateScope> {
        self.exclude_scopes.iter().flatten()
    }
}

/// Reject scopes that constrain nothing
pub fn validate_scopes(scopes: &[Option<DelegateScope>]) -> Result<()> {
    if scopes.iter().flatten().any(|s| !s.is_valid()) {
        return Err(AppError::InvalidRequest(
            "Delegate scope cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Heartbeat payload from one delegate connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHeartbeat {
    pub connection_id: Uuid,
    #[serde(default)]
    pub version: String,
}

/// One live connection of a delegate process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateConnection {
    pub id: Uuid,
    pub account_id: String,
    pub delegate_id: Uuid,
    pub version: String,
    pub last_heartbeat: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_delegate(status: DelegateStatus) -> Delegate {
        Delegate::new(
            "acct",
            NewDelegate {
                host_name: "Host-1".to_string(),
                delegate_name: "primary".to_string(),
                tags: vec![" A ".to_string(), "b".to_string()],
                declared_selectors: vec!["k8s".to_string()],
                status: Some(status),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    fn context(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            DelegateStatus::Enabled,
            DelegateStatus::WaitingForApproval,
            DelegateStatus::Disabled,
            DelegateStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<DelegateStatus>().unwrap(), status);
        }
        assert!("paused".parse::<DelegateStatus>().is_err());
    }

    #[test]
    fn test_activity_respects_heartbeat_age() {
        let max_age = Duration::seconds(300);
        let delegate = make_delegate(DelegateStatus::Enabled);
        let heartbeat = delegate.last_heartbeat;

        assert_eq!(delegate.activity(heartbeat + max_age, max_age), DelegateActivity::Active);
        assert_eq!(
            delegate.activity(heartbeat + max_age + Duration::milliseconds(1), max_age),
            DelegateActivity::Disconnected
        );
    }

    #[test]
    fn test_activity_by_status() {
        let max_age = Duration::seconds(300);
        let now = Utc::now();
        assert_eq!(
            make_delegate(DelegateStatus::WaitingForApproval).activity(now, max_age),
            DelegateActivity::WaitingForApproval
        );
        assert_eq!(
            make_delegate(DelegateStatus::Disabled).activity(now, max_age),
            DelegateActivity::Other
        );
        assert!(!make_delegate(DelegateStatus::Deleted).is_active(now, max_age));
    }

    #[test]
    fn test_selectors_are_normalized() {
        let delegate = make_delegate(DelegateStatus::Enabled);
        let explicit = delegate.explicit_selectors();
        assert!(explicit.contains("a"));
        assert!(explicit.contains("b"));
        assert!(explicit.contains("k8s"));

        let implicit = delegate.implicit_selectors();
        assert!(implicit.contains("host-1"));
        assert!(implicit.contains("primary"));
    }

    #[test]
    fn test_scope_empty_dimensions_do_not_constrain() {
        let scope = DelegateScope::new("prod").with_environment_types(["PROD"]);
        assert!(scope.matches(&context(&[(context_keys::ENV_TYPE, "PROD")])));
        assert!(!scope.matches(&context(&[(context_keys::ENV_TYPE, "NON_PROD")])));
        assert!(!scope.matches(&context(&[])));
    }

    #[test]
    fn test_scope_all_dimensions_must_match() {
        let scope = DelegateScope::new("svc")
            .with_services(["svc-1"])
            .with_infrastructure_definitions(["infra-1"]);

        assert!(scope.matches(&context(&[
            (context_keys::SERVICE_ID, "svc-1"),
            (context_keys::INFRA_DEFINITION_ID, "infra-1"),
        ])));
        assert!(!scope.matches(&context(&[
            (context_keys::SERVICE_ID, "svc-1"),
            (context_keys::INFRA_DEFINITION_ID, "infra-2"),
        ])));
    }

    #[test]
    fn test_validate_scopes() {
        assert!(validate_scopes(&[None, Some(DelegateScope::new("x").with_applications(["app"]))]).is_ok());
        let err = validate_scopes(&[Some(DelegateScope::new("empty"))]).unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[test]
    fn test_null_scopes_are_skipped() {
        let mut delegate = make_delegate(DelegateStatus::Enabled);
        delegate.include_scopes = vec![None, Some(DelegateScope::new("a").with_environments(["e"]))];
        assert_eq!(delegate.include_scopes().count(), 1);
    }
}
