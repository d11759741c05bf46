//! Status types shared by every extension object
//!
//! The reconciler owns all of these. The harness reads them to decide whether
//! an object has converged and writes them only for the recovery fault
//! injection.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Schema for opaque JSON payloads (`providerConfig`, `providerStatus`, `state`)
pub(crate) fn preserve_unknown_fields(
    _: &mut schemars::gen::SchemaGenerator,
) -> schemars::schema::Schema {
    use schemars::schema::{InstanceType, Schema, SchemaObject};

    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Kind of operation the reconciler last performed
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationType {
    /// First reconcile of a new object
    Create,
    /// Any later reconcile
    #[default]
    Reconcile,
    /// Teardown after deletion
    Delete,
    /// State migration to another seed
    Migrate,
    /// State restoration after migration
    Restore,
}

impl std::fmt::Display for LastOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "Create"),
            Self::Reconcile => write!(f, "Reconcile"),
            Self::Delete => write!(f, "Delete"),
            Self::Migrate => write!(f, "Migrate"),
            Self::Restore => write!(f, "Restore"),
        }
    }
}

/// Progress state of the last operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationState {
    /// Queued, not yet started
    Pending,
    /// In progress
    #[default]
    Processing,
    /// Finished successfully
    Succeeded,
    /// Failed; the reconciler will retry
    Error,
    /// Failed permanently; no retry
    Failed,
    /// Cancelled
    Aborted,
}

impl LastOperationState {
    /// True for states the reconciler will not leave on its own
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Aborted)
    }
}

impl std::fmt::Display for LastOperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Processing => write!(f, "Processing"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Error => write!(f, "Error"),
            Self::Failed => write!(f, "Failed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

impl FromStr for LastOperationState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Processing" => Ok(Self::Processing),
            "Succeeded" => Ok(Self::Succeeded),
            "Error" => Ok(Self::Error),
            "Failed" => Ok(Self::Failed),
            "Aborted" => Ok(Self::Aborted),
            _ => Err(crate::Error::validation(format!(
                "unknown lastOperation state '{s}'"
            ))),
        }
    }
}

/// The operation the reconciler last performed on the object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Operation kind
    #[serde(rename = "type")]
    pub type_: LastOperationType,

    /// Operation state
    pub state: LastOperationState,

    /// Completion percentage
    #[serde(default)]
    pub progress: i32,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Last time the operation was updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl std::fmt::Display for LastOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({}%)", self.type_, self.state, self.progress)?;
        if !self.description.is_empty() {
            write!(f, ": {}", self.description)?;
        }
        Ok(())
    }
}

/// Error the reconciler hit during its last operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Human-readable description
    pub description: String,

    /// Task that failed, if the reconciler runs a task graph
    #[serde(default, rename = "taskID", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Machine-readable error codes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,

    /// Time the error was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Status block common to every extension object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    /// Last operation performed by the reconciler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    /// Error from the last operation, cleared on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,

    /// Generation the reconciler last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Provider-specific result, e.g. the identifiers of created resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<serde_json::Value>,

    /// Opaque state the reconciler persists between runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub state: Option<serde_json::Value>,
}

impl ExtensionStatus {
    /// Set the last operation and return self for chaining
    pub fn last_operation(mut self, type_: LastOperationType, state: LastOperationState) -> Self {
        self.last_operation = Some(LastOperation {
            type_,
            state,
            progress: 100,
            description: String::new(),
            last_update_time: Some(Utc::now()),
        });
        self
    }

    /// Set the last error and return self for chaining
    pub fn last_error(mut self, description: impl Into<String>) -> Self {
        self.last_error = Some(LastError {
            description: description.into(),
            ..Default::default()
        });
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }

    /// Set the provider status and return self for chaining
    pub fn provider_status(mut self, value: serde_json::Value) -> Self {
        self.provider_status = Some(value);
        self
    }

    /// Set the persisted state and return self for chaining
    pub fn state(mut self, value: serde_json::Value) -> Self {
        self.state = Some(value);
        self
    }

    /// One-line summary for diagnostics
    pub fn summary(&self) -> String {
        let op = self
            .last_operation
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "no lastOperation".to_string());
        match &self.last_error {
            Some(err) => format!("{op}; lastError: {}", err.description),
            None => op,
        }
    }
}
