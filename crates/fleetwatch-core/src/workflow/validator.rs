//! Workflow validator — rejects malformed definitions before they reach
//! workers.
//!
//! Validation runs on the raw JSON value first so that every rejection names
//! the offending field (and step index), then deserializes into the typed
//! schema. The check is pure: no I/O, deterministic for a given input.

use serde_json::Value;

use super::schema::{StepKind, WorkflowDefinition};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("workflow must be a JSON object")]
    NotAnObject,

    #[error("workflow is missing a non-empty 'id'")]
    MissingId,

    #[error("workflow id '{0}' may only contain letters, digits, '.', '_' and '-'")]
    UnsafeId(String),

    #[error("workflow '{0}' is missing a 'steps' array")]
    MissingSteps(String),

    #[error("workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("workflow '{0}': 'critical_path' must be a boolean")]
    CriticalPathNotBoolean(String),

    #[error("workflow '{id}': invalid category '{category}'")]
    InvalidCategory { id: String, category: String },

    #[error("workflow '{id}' step {index}: unknown step type '{step_type}'")]
    UnknownStepType {
        id: String,
        index: usize,
        step_type: String,
    },

    #[error("workflow '{id}' step {index} ({step_type}): missing required field '{field}'")]
    StepMissingField {
        id: String,
        index: usize,
        step_type: String,
        field: &'static str,
    },

    #[error("workflow '{0}' depends on itself")]
    SelfDependency(String),

    #[error("malformed workflow: {0}")]
    Malformed(String),
}

/// Fields each step type requires, beyond `type` and `action`.
fn required_fields(step_type: &str) -> Option<&'static [&'static str]> {
    match step_type {
        "ui" => Some(&["selector"]),
        "api" => Some(&["method", "path"]),
        "integration" => Some(&["service", "method", "path", "rule"]),
        _ => None,
    }
}

/// Ids name evidence and catalog files, so they must stay a single path
/// component.
fn check_id(id: &str) -> Result<(), SchemaError> {
    let charset = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !charset || id.contains("..") {
        return Err(SchemaError::UnsafeId(id.to_string()));
    }
    Ok(())
}

fn non_empty_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Validate a candidate workflow and return its typed form.
pub fn validate_workflow(candidate: &Value) -> Result<WorkflowDefinition, SchemaError> {
    let obj = candidate.as_object().ok_or(SchemaError::NotAnObject)?;

    let id = non_empty_str(candidate, "id")
        .ok_or(SchemaError::MissingId)?
        .to_string();
    check_id(&id)?;

    let steps = match obj.get("steps") {
        Some(Value::Array(steps)) => steps,
        _ => return Err(SchemaError::MissingSteps(id)),
    };
    if steps.is_empty() {
        return Err(SchemaError::NoSteps(id));
    }

    match obj.get("critical_path") {
        Some(Value::Bool(_)) => {}
        _ => return Err(SchemaError::CriticalPathNotBoolean(id)),
    }

    let category = obj
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if super::WorkflowCategory::parse(category).is_none() {
        return Err(SchemaError::InvalidCategory {
            id,
            category: category.to_string(),
        });
    }

    for (i, step) in steps.iter().enumerate() {
        let index = i + 1;
        let step_type = step.get("type").and_then(Value::as_str).unwrap_or_default();
        let required = required_fields(step_type).ok_or_else(|| SchemaError::UnknownStepType {
            id: id.clone(),
            index,
            step_type: step_type.to_string(),
        })?;
        if non_empty_str(step, "action").is_none() {
            return Err(SchemaError::StepMissingField {
                id,
                index,
                step_type: step_type.to_string(),
                field: "action",
            });
        }
        for field in required.iter().copied() {
            if non_empty_str(step, field).is_none() {
                return Err(SchemaError::StepMissingField {
                    id,
                    index,
                    step_type: step_type.to_string(),
                    field,
                });
            }
        }
    }

    let workflow: WorkflowDefinition = serde_json::from_value(candidate.clone())
        .map_err(|e| SchemaError::Malformed(format!("workflow '{}': {}", id, e)))?;
    validate_definition(&workflow)?;
    Ok(workflow)
}

/// Validate an already-typed definition (used for curated and synthesized
/// workflows before they are written to the catalog).
pub fn validate_definition(workflow: &WorkflowDefinition) -> Result<(), SchemaError> {
    if workflow.id.trim().is_empty() {
        return Err(SchemaError::MissingId);
    }
    check_id(&workflow.id)?;
    if workflow.steps.is_empty() {
        return Err(SchemaError::NoSteps(workflow.id.clone()));
    }
    if workflow.dependencies.iter().any(|d| d == &workflow.id) {
        return Err(SchemaError::SelfDependency(workflow.id.clone()));
    }
    for (i, step) in workflow.steps.iter().enumerate() {
        let index = i + 1;
        let missing = |step_type: &str, field: &'static str| SchemaError::StepMissingField {
            id: workflow.id.clone(),
            index,
            step_type: step_type.to_string(),
            field,
        };
        if step.action.trim().is_empty() {
            return Err(missing(step.kind.category().as_str(), "action"));
        }
        match &step.kind {
            StepKind::Ui(ui) => {
                if ui.selector.trim().is_empty() {
                    return Err(missing("ui", "selector"));
                }
            }
            StepKind::Api(api) => {
                if api.method.trim().is_empty() {
                    return Err(missing("api", "method"));
                }
                if api.path.trim().is_empty() {
                    return Err(missing("api", "path"));
                }
            }
            StepKind::Integration(int) => {
                for (field, value) in [
                    ("service", &int.service),
                    ("method", &int.method),
                    ("path", &int.path),
                    ("rule", &int.rule),
                ] {
                    if value.trim().is_empty() {
                        return Err(missing("integration", field));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "id": "wf-1",
            "category": "api",
            "critical_path": true,
            "steps": [
                {"type": "api", "action": "check", "method": "GET", "path": "/health"}
            ]
        })
    }

    #[test]
    fn test_accepts_valid_workflow() {
        let wf = validate_workflow(&valid()).unwrap();
        assert_eq!(wf.id, "wf-1");
        assert!(wf.critical_path);
    }

    #[test]
    fn test_rejects_empty_steps() {
        let candidate = json!({"id": "wf-1", "steps": []});
        let err = validate_workflow(&candidate).unwrap_err();
        assert_eq!(err, SchemaError::NoSteps("wf-1".to_string()));
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn test_rejects_missing_required_fields() {
        let mut missing_id = valid();
        missing_id.as_object_mut().unwrap().remove("id");
        assert_eq!(validate_workflow(&missing_id), Err(SchemaError::MissingId));

        let mut missing_steps = valid();
        missing_steps.as_object_mut().unwrap().remove("steps");
        assert!(matches!(
            validate_workflow(&missing_steps),
            Err(SchemaError::MissingSteps(_))
        ));

        let mut bad_flag = valid();
        bad_flag["critical_path"] = json!("yes");
        assert!(matches!(
            validate_workflow(&bad_flag),
            Err(SchemaError::CriticalPathNotBoolean(_))
        ));

        let mut no_flag = valid();
        no_flag.as_object_mut().unwrap().remove("critical_path");
        assert!(matches!(
            validate_workflow(&no_flag),
            Err(SchemaError::CriticalPathNotBoolean(_))
        ));
    }

    #[test]
    fn test_rejects_steps_missing_type_fields() {
        let ui_without_selector = json!({
            "id": "wf-ui",
            "category": "ui",
            "critical_path": false,
            "steps": [{"type": "ui", "action": "click"}]
        });
        assert_eq!(
            validate_workflow(&ui_without_selector),
            Err(SchemaError::StepMissingField {
                id: "wf-ui".to_string(),
                index: 1,
                step_type: "ui".to_string(),
                field: "selector",
            })
        );

        let api_without_path = json!({
            "id": "wf-api",
            "category": "api",
            "critical_path": false,
            "steps": [
                {"type": "api", "action": "check", "method": "GET", "path": "/ok"},
                {"type": "api", "action": "check", "method": "GET"}
            ]
        });
        match validate_workflow(&api_without_path) {
            Err(SchemaError::StepMissingField { index, field, .. }) => {
                assert_eq!(index, 2);
                assert_eq!(field, "path");
            }
            other => panic!("expected missing path, got {:?}", other),
        }

        let unknown_type = json!({
            "id": "wf-x",
            "category": "api",
            "critical_path": false,
            "steps": [{"type": "ftp", "action": "put"}]
        });
        assert!(matches!(
            validate_workflow(&unknown_type),
            Err(SchemaError::UnknownStepType { .. })
        ));
    }

    #[test]
    fn test_rejects_self_dependency() {
        let mut candidate = valid();
        candidate["dependencies"] = json!(["wf-1"]);
        assert_eq!(
            validate_workflow(&candidate),
            Err(SchemaError::SelfDependency("wf-1".to_string()))
        );
    }

    #[test]
    fn test_rejects_ids_that_escape_their_file() {
        for id in ["zoho/sync", "a\\b", "..", "../../outside", "wf 1"] {
            let mut candidate = valid();
            candidate["id"] = json!(id);
            assert_eq!(
                validate_workflow(&candidate),
                Err(SchemaError::UnsafeId(id.to_string())),
                "{}",
                id
            );
        }

        let mut typed = validate_workflow(&valid()).unwrap();
        typed.id = "nested/wf".to_string();
        assert_eq!(
            validate_definition(&typed),
            Err(SchemaError::UnsafeId("nested/wf".to_string()))
        );

        for id in ["api-post-api-calculate", "ui_flow.v2", "int-zoho-invoice-create"] {
            let mut candidate = valid();
            candidate["id"] = json!(id);
            assert!(validate_workflow(&candidate).is_ok(), "{}", id);
        }
    }

    #[test]
    fn test_validator_is_deterministic() {
        let candidate = json!({"id": "wf-1", "category": "ui", "critical_path": false, "steps": []});
        assert_eq!(validate_workflow(&candidate), validate_workflow(&candidate));
        assert_eq!(validate_workflow(&json!([])), Err(SchemaError::NotAnObject));
    }
}
