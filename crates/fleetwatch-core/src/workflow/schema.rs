//! JSON schema types for workflow definitions.
//!
//! One workflow is stored per file under the catalog directory of the worker
//! that owns it:
//!
//! ```json
//! {
//!   "id": "api-post-api-calculate",
//!   "description": "POST /api/calculate responds 2xx",
//!   "category": "api",
//!   "critical_path": true,
//!   "expected_duration_ms": 2000,
//!   "dependencies": [],
//!   "steps": [
//!     {
//!       "action": "probe",
//!       "type": "api",
//!       "method": "POST",
//!       "path": "/api/calculate",
//!       "body": {},
//!       "validation": "responds with a 2xx status"
//!     }
//!   ]
//! }
//! ```
//!
//! Step order is significant and is preserved exactly as written.

use serde::{Deserialize, Serialize};

/// Which surface of the application a workflow or step exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCategory {
    Ui,
    Api,
    Integration,
}

impl WorkflowCategory {
    pub const ALL: [WorkflowCategory; 3] = [
        WorkflowCategory::Ui,
        WorkflowCategory::Api,
        WorkflowCategory::Integration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowCategory::Ui => "ui",
            WorkflowCategory::Api => "api",
            WorkflowCategory::Integration => "integration",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ui" => Some(WorkflowCategory::Ui),
            "api" => Some(WorkflowCategory::Api),
            "integration" => Some(WorkflowCategory::Integration),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, ordered sequence of steps with expected validations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow ID (also the catalog file stem)
    pub id: String,

    /// Human description
    #[serde(default)]
    pub description: String,

    pub category: WorkflowCategory,

    /// A failing critical-path workflow blocks merges
    pub critical_path: bool,

    /// Expected duration hint in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_ms: Option<u64>,

    /// Workflow IDs that must have passed before this one runs
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Ordered steps, never empty
    pub steps: Vec<WorkflowStep>,
}

/// One action within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Action name; interpreted by the worker that runs the step
    pub action: String,

    /// Type discriminator plus type-specific payload
    #[serde(flatten)]
    pub kind: StepKind,

    /// Free-text validation expectation
    #[serde(default)]
    pub validation: String,
}

/// Type-specific step payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Ui(UiStep),
    Api(ApiStep),
    Integration(IntegrationStep),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiStep {
    /// CSS selector the action targets
    pub selector: String,

    /// Input value (text to type, option to select, path to navigate to)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiStep {
    /// HTTP method, e.g. `GET`
    pub method: String,

    /// Path relative to the application base URL
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    /// Optional advisory response validator name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStep {
    /// External service the step crosses into (e.g. `zoho`, `fullbay`)
    pub service: String,

    pub method: String,

    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    /// Response validator name, advisory only
    pub rule: String,
}

impl StepKind {
    pub fn category(&self) -> WorkflowCategory {
        match self {
            StepKind::Ui(_) => WorkflowCategory::Ui,
            StepKind::Api(_) => WorkflowCategory::Api,
            StepKind::Integration(_) => WorkflowCategory::Integration,
        }
    }

    /// The selector or endpoint the step touches, for evidence records.
    pub fn target(&self) -> String {
        match self {
            StepKind::Ui(ui) => ui.selector.clone(),
            StepKind::Api(api) => format!("{} {}", api.method, api.path),
            StepKind::Integration(int) => format!("{} {}", int.method, int.path),
        }
    }
}

impl WorkflowStep {
    pub fn ui(action: &str, selector: &str, value: Option<&str>, validation: &str) -> Self {
        Self {
            action: action.to_string(),
            kind: StepKind::Ui(UiStep {
                selector: selector.to_string(),
                value: value.map(str::to_string),
            }),
            validation: validation.to_string(),
        }
    }

    pub fn api(
        action: &str,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
        validation: &str,
    ) -> Self {
        Self {
            action: action.to_string(),
            kind: StepKind::Api(ApiStep {
                method: method.to_string(),
                path: path.to_string(),
                body,
                rule: None,
            }),
            validation: validation.to_string(),
        }
    }
}

impl WorkflowDefinition {
    /// Parse and validate a workflow from JSON text.
    pub fn from_json(json: &str) -> Result<Self, super::SchemaError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| super::SchemaError::Malformed(e.to_string()))?;
        super::validate_workflow(&value)
    }

    /// Load and validate a workflow file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, super::SchemaError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            super::SchemaError::Malformed(format!(
                "Failed to read workflow file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Canonical on-disk form: pretty JSON with a trailing newline.
    pub fn to_catalog_json(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }
}
