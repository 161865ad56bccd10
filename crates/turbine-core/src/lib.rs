use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod components;
mod namespace;
mod recent;
mod settings;

pub use components::{
    build_component_table, build_matrix, group_by_key, replace_snapshot, ComponentVersionInfo,
    DeploymentKey, MatrixRow, MatrixView, NamespaceComponentTable, NamespaceComponents,
    NamespaceMatrix, VisibleEnvironments,
};
pub use namespace::{
    build_environment_url, build_namespace_with_env, build_turbine_url, environment_path_token,
    get_base_namespace, parse_turbine_url, parse_turbine_url_at, split_environment_suffix,
    DEFAULT_VIEW_PATH,
};
pub use recent::{
    environment_links, filter_recent, format_relative, switchable_environments, upsert_recent,
    EnvironmentLink,
};
pub use settings::{normalize_base_url, Settings};

pub const RECENT_ENVIRONMENTS_KEY: &str = "turbine_recent_environments";
pub const SETTINGS_KEY: &str = "turbine_settings";
pub const COMPONENT_DEPLOYMENTS_KEY: &str = "turbine_component_deployments";
pub const VISIBLE_ENVIRONMENTS_KEY: &str = "turbine_visible_environments";
pub const DEFAULT_BASE_URL: &str = "";
pub const MAX_RECENT_ITEMS: usize = 15;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown environment tag: {0}")]
    UnknownEnvironment(String),
}

/// Deployment stage of a Turbine namespace.
///
/// Declaration order is the canonical column order used by every view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Sit,
    Uat1,
    Qa,
    Prep,
    Prod,
    Unknown,
}

impl Environment {
    /// The closed set of tags that may appear as a namespace suffix.
    pub const KNOWN: [Environment; 6] = [
        Self::Dev,
        Self::Sit,
        Self::Uat1,
        Self::Qa,
        Self::Prep,
        Self::Prod,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Sit => "sit",
            Self::Uat1 => "uat1",
            Self::Qa => "qa",
            Self::Prep => "prep",
            Self::Prod => "prod",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a tag, ignoring ASCII case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::KNOWN
            .into_iter()
            .chain([Self::Unknown])
            .find(|env| env.as_str().eq_ignore_ascii_case(value))
    }

    #[must_use]
    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| CoreError::UnknownEnvironment(value.to_string()))
    }
}

/// Which of the two interchangeable mid-tier environments a service uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum QaUat1Preference {
    Qa,
    Uat1,
    #[default]
    Undetermined,
}

impl QaUat1Preference {
    #[must_use]
    pub fn from_environment(environment: Environment) -> Self {
        match environment {
            Environment::Qa => Self::Qa,
            Environment::Uat1 => Self::Uat1,
            _ => Self::Undetermined,
        }
    }

    #[must_use]
    pub fn is_determined(self) -> bool {
        self != Self::Undetermined
    }

    /// Sticky merge: a determined preference is never downgraded to undetermined.
    #[must_use]
    pub fn merge(existing: Self, incoming: Self) -> Self {
        if existing.is_determined() && !incoming.is_determined() {
            existing
        } else {
            incoming
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qa => "qa",
            Self::Uat1 => "uat1",
            Self::Undetermined => "undetermined",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct RecordId(pub String);

impl RecordId {
    /// Build an identifier from namespace, environment and a time-ordered ULID.
    #[must_use]
    pub fn derive(namespace: &str, environment: Environment, created_at: OffsetDateTime) -> Self {
        let ulid = Ulid::from_datetime(std::time::SystemTime::from(created_at));
        Self(format!("{namespace}-{}-{ulid}", environment.as_str()))
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VisitedEnvironment {
    pub id: RecordId,
    pub namespace: String,
    pub environment: Environment,
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_visited_at: OffsetDateTime,
    #[serde(default)]
    pub qa_uat1_preference: QaUat1Preference,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComponentDeployment {
    pub component_name: String,
    pub version: String,
    pub namespace: String,
    pub environment: Environment,
    pub env_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub extracted_at: OffsetDateTime,
}

impl ComponentDeployment {
    #[must_use]
    pub fn key(&self) -> DeploymentKey {
        DeploymentKey {
            namespace: self.namespace.clone(),
            environment: self.environment,
        }
    }
}

/// Message exchanged between the page-scraping context and the background.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeMessage {
    ComponentData(Vec<ComponentDeployment>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MessageAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageAck {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}
