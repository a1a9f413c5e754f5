//! Task definition models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable integer identifier of a task definition.
pub type TaskId = i64;

/// A named, cron-triggered shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Unique task ID.
    pub id: TaskId,
    /// Display name.
    pub name: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Optional icon identifier for dashboards.
    pub icon: Option<String>,
    /// Cron expression (e.g., "0 * * * *" for hourly).
    pub cron: String,
    /// Shell command to execute.
    pub command: String,
    /// Environment overrides applied on top of the process environment.
    pub envs: Option<BTreeMap<String, String>>,
    /// Whether the recurring job should be registered.
    pub enabled: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a task definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    pub cron: String,
    pub command: String,
    #[serde(default)]
    pub envs: Option<BTreeMap<String, String>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewTask {
    /// Create an enabled task input with the required fields.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        cron: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            command: command.into(),
            enabled: true,
            ..Self::default()
        }
    }

    /// Set a single environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Partial update of a task definition. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub envs: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl TaskPatch {
    /// Change only the cron expression.
    #[must_use]
    pub fn cron(cron: impl Into<String>) -> Self {
        Self {
            cron: Some(cron.into()),
            ..Self::default()
        }
    }

    /// Change only the enabled flag.
    #[must_use]
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    /// Apply the patch to a task, stamping `updated_at`.
    #[must_use]
    pub fn apply_to(&self, task: &TaskDefinition, now: DateTime<Utc>) -> TaskDefinition {
        let mut next = task.clone();
        if let Some(name) = &self.name {
            next.name.clone_from(name);
        }
        if let Some(description) = &self.description {
            next.description = Some(description.clone());
        }
        if let Some(icon) = &self.icon {
            next.icon = Some(icon.clone());
        }
        if let Some(cron) = &self.cron {
            next.cron.clone_from(cron);
        }
        if let Some(command) = &self.command {
            next.command.clone_from(command);
        }
        if let Some(envs) = &self.envs {
            next.envs = Some(envs.clone());
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        next.updated_at = now;
        next
    }
}
