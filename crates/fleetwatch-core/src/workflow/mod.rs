//! Workflow catalog — schema, validation, storage and discovery.
//!
//! ```text
//! UI markup ──┐
//! route table ├─► Discoverer ──► validate ──► workflows/<agent>/<id>.json
//! curated ────┘                                       │
//!                                          load_agent_workflows (workers)
//! ```

pub mod catalog;
pub mod discovery;
pub mod schema;
pub mod validator;

pub use catalog::{
    list_agents, load_agent_workflows, load_catalog, write_catalog, Catalog, LoadedWorkflows,
    SkippedWorkflow,
};
pub use discovery::{Discoverer, DiscoveryConfig, DiscoveryError, DiscoveryReport};
pub use schema::{
    ApiStep, IntegrationStep, StepKind, UiStep, WorkflowCategory, WorkflowDefinition,
    WorkflowStep,
};
pub use validator::{validate_definition, validate_workflow, SchemaError};
