//! Workflow discoverer — builds the catalog from static inspection of the
//! target application plus curated domain flows.
//!
//! Discovery is a hybrid:
//! - UI: interactive elements with an `id=` attribute found in the markup,
//!   each yielding a presence check, plus the curated critical-path flows.
//! - API: `app.<method>('<path>')` entries of the server route table, each
//!   yielding a "responds 2xx" probe; paths containing a critical keyword
//!   are marked critical.
//! - Integration: hand-authored only, with explicit dependency links.
//!
//! Output is a pure function of the inputs (sorted, no timestamps), so two
//! runs against an unchanged target produce identical catalogs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::catalog::Catalog;
use super::schema::{
    IntegrationStep, StepKind, WorkflowCategory, WorkflowDefinition, WorkflowStep,
};
use super::validator::{validate_definition, SchemaError};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to read {kind} source '{path}': {message}")]
    SourceUnreadable {
        kind: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("Failed to read discovery config '{path}': {message}")]
    Config { path: PathBuf, message: String },

    #[error("Discovered workflow is invalid: {0}")]
    Invalid(#[from] SchemaError),

    #[error("Discovery produced an empty catalog")]
    EmptyCatalog,
}

/// Which worker owns each category of workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAssignment {
    #[serde(default = "default_ui_agent")]
    pub ui: String,
    #[serde(default = "default_api_agent")]
    pub api: String,
    #[serde(default = "default_integration_agent")]
    pub integration: String,
}

fn default_ui_agent() -> String {
    "ui-agent".to_string()
}

fn default_api_agent() -> String {
    "api-agent".to_string()
}

fn default_integration_agent() -> String {
    "integration-agent".to_string()
}

impl Default for AgentAssignment {
    fn default() -> Self {
        Self {
            ui: default_ui_agent(),
            api: default_api_agent(),
            integration: default_integration_agent(),
        }
    }
}

impl AgentAssignment {
    pub fn for_category(&self, category: WorkflowCategory) -> &str {
        match category {
            WorkflowCategory::Ui => &self.ui,
            WorkflowCategory::Api => &self.api,
            WorkflowCategory::Integration => &self.integration,
        }
    }
}

/// Discovery inputs. The curated flow lists are configuration data: the
/// defaults carry the quoting application's critical paths and a YAML file
/// may replace them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UI markup to scan (e.g. `frontend/integrated-ui.html`)
    #[serde(default)]
    pub ui_source: Option<PathBuf>,

    /// Server route table to scan (e.g. `src/api/server.js`)
    #[serde(default)]
    pub routes_source: Option<PathBuf>,

    /// Endpoints whose path contains one of these are critical
    #[serde(default = "default_critical_keywords")]
    pub critical_keywords: Vec<String>,

    #[serde(default)]
    pub agents: AgentAssignment,

    /// Substituted for `:param` path segments in probes
    #[serde(default = "default_path_placeholder")]
    pub path_placeholder: String,

    #[serde(default = "curated_ui_flows")]
    pub critical_flows: Vec<WorkflowDefinition>,

    #[serde(default = "curated_integration_flows")]
    pub integration_flows: Vec<WorkflowDefinition>,
}

fn default_critical_keywords() -> Vec<String> {
    vec!["calculate".to_string(), "generate-pdf".to_string()]
}

fn default_path_placeholder() -> String {
    "sample".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ui_source: None,
            routes_source: None,
            critical_keywords: default_critical_keywords(),
            agents: AgentAssignment::default(),
            path_placeholder: default_path_placeholder(),
            critical_flows: curated_ui_flows(),
            integration_flows: curated_integration_flows(),
        }
    }
}

impl DiscoveryConfig {
    /// Load a YAML discovery config. Relative source paths are resolved
    /// against the config file's directory.
    pub fn from_file(path: &Path) -> Result<Self, DiscoveryError> {
        let content = std::fs::read_to_string(path).map_err(|e| DiscoveryError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut config: DiscoveryConfig =
            serde_yaml::from_str(&content).map_err(|e| DiscoveryError::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for source in [&mut config.ui_source, &mut config.routes_source] {
            if let Some(p) = source.as_mut() {
                if p.is_relative() {
                    *p = base.join(&p);
                }
            }
        }
        Ok(config)
    }
}

/// An interactive element found in the markup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScannedElement {
    pub id: String,
    pub tag: String,
}

/// A method/path pair found in the route table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScannedRoute {
    pub method: String,
    pub path: String,
}

const INTERACTIVE_TAGS: &[&str] = &["input", "button", "select", "textarea"];

const ACTION_TOKENS: &[&str] = &[
    "btn", "button", "submit", "search", "add", "calculate", "generate", "save", "create",
    "enrich",
];

/// Best-effort scan of markup for elements that look like inputs or buttons.
pub fn scan_ui_markup(markup: &str) -> Vec<ScannedElement> {
    let tag_re = Regex::new(r"(?is)<([a-z][a-z0-9-]*)\b([^>]*)>").expect("static regex");
    let id_re = Regex::new(r#"(?i)\bid\s*=\s*["']([^"']+)["']"#).expect("static regex");

    let mut found = std::collections::BTreeSet::new();
    for caps in tag_re.captures_iter(markup) {
        let tag = caps[1].to_lowercase();
        let Some(id_caps) = id_re.captures(&caps[2]) else {
            continue;
        };
        let id = id_caps[1].trim().to_string();
        // Template placeholders are not stable selectors.
        if id.is_empty() || id.contains("${") || id.contains("{{") {
            continue;
        }
        let lower_id = id.to_lowercase();
        let interactive = INTERACTIVE_TAGS.contains(&tag.as_str())
            || ACTION_TOKENS.iter().any(|t| lower_id.contains(t));
        if interactive {
            found.insert(ScannedElement { id, tag });
        }
    }
    found.into_iter().collect()
}

/// Scan a server source file for `app.get('/path', …)`-style routes.
pub fn scan_route_table(source: &str) -> Vec<ScannedRoute> {
    let route_re = Regex::new(
        r#"\b(?:app|router)\s*\.\s*(get|post|put|patch|delete)\s*\(\s*['"`]([^'"`]+)['"`]"#,
    )
    .expect("static regex");

    let mut found = std::collections::BTreeSet::new();
    for caps in route_re.captures_iter(source) {
        found.insert(ScannedRoute {
            method: caps[1].to_uppercase(),
            path: caps[2].trim().to_string(),
        });
    }
    found.into_iter().collect()
}

/// Lowercase, non-alphanumeric runs collapsed to `-`.
pub fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_dash = true;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// CSS selector for an element ID, quoting IDs that `#id` cannot express.
pub fn id_selector(id: &str) -> String {
    let simple = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !id.starts_with(|c: char| c.is_ascii_digit());
    if simple {
        format!("#{}", id)
    } else {
        format!("[id=\"{}\"]", id.replace('"', "\\\""))
    }
}

fn element_workflow(element: &ScannedElement) -> WorkflowDefinition {
    WorkflowDefinition {
        id: format!("ui-element-{}", slug(&element.id)),
        description: format!("Element #{} ({}) is present", element.id, element.tag),
        category: WorkflowCategory::Ui,
        critical_path: false,
        expected_duration_ms: Some(2_000),
        dependencies: vec![],
        steps: vec![WorkflowStep::ui(
            "assert-visible",
            &id_selector(&element.id),
            None,
            "element is rendered and visible",
        )],
    }
}

fn route_workflow(route: &ScannedRoute, config: &DiscoveryConfig) -> WorkflowDefinition {
    let path = route
        .path
        .split('/')
        .map(|segment| {
            if segment.starts_with(':') {
                config.path_placeholder.as_str()
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/");
    let body = match route.method.as_str() {
        "POST" | "PUT" | "PATCH" => Some(json!({})),
        _ => None,
    };
    let critical = config
        .critical_keywords
        .iter()
        .any(|k| route.path.to_lowercase().contains(&k.to_lowercase()));
    WorkflowDefinition {
        id: format!("api-{}-{}", route.method.to_lowercase(), slug(&route.path)),
        description: format!("{} {} responds 2xx", route.method, route.path),
        category: WorkflowCategory::Api,
        critical_path: critical,
        expected_duration_ms: Some(1_000),
        dependencies: vec![],
        steps: vec![WorkflowStep::api(
            "probe",
            &route.method,
            &path,
            body,
            "responds with a 2xx status",
        )],
    }
}

/// Summary of what a discovery pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub scanned_elements: usize,
    pub scanned_routes: usize,
    pub per_agent: BTreeMap<String, usize>,
}

pub struct Discoverer {
    config: DiscoveryConfig,
}

impl Discoverer {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn read_source(kind: &'static str, path: &Path) -> Result<String, DiscoveryError> {
        std::fs::read_to_string(path).map_err(|e| DiscoveryError::SourceUnreadable {
            kind,
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Scan the configured UI source, if any.
    pub fn scan_elements(&self) -> Result<Vec<ScannedElement>, DiscoveryError> {
        match &self.config.ui_source {
            Some(path) => Ok(scan_ui_markup(&Self::read_source("UI", path)?)),
            None => Ok(vec![]),
        }
    }

    /// Scan the configured route table, if any.
    pub fn scan_routes(&self) -> Result<Vec<ScannedRoute>, DiscoveryError> {
        match &self.config.routes_source {
            Some(path) => Ok(scan_route_table(&Self::read_source("route table", path)?)),
            None => Ok(vec![]),
        }
    }

    /// Build the catalog: scanned plus curated workflows, validated, grouped
    /// by owning agent and sorted by ID. Curated workflows win over scanned
    /// ones with the same ID.
    pub fn discover(&self) -> Result<(Catalog, DiscoveryReport), DiscoveryError> {
        let elements = self.scan_elements()?;
        let routes = self.scan_routes()?;

        let mut by_id: BTreeMap<String, WorkflowDefinition> = BTreeMap::new();
        for element in &elements {
            let wf = element_workflow(element);
            by_id.insert(wf.id.clone(), wf);
        }
        for route in &routes {
            let wf = route_workflow(route, &self.config);
            by_id.insert(wf.id.clone(), wf);
        }
        for wf in self
            .config
            .critical_flows
            .iter()
            .chain(self.config.integration_flows.iter())
        {
            by_id.insert(wf.id.clone(), wf.clone());
        }

        if by_id.is_empty() {
            return Err(DiscoveryError::EmptyCatalog);
        }

        let mut catalog = Catalog::new();
        let mut report = DiscoveryReport {
            scanned_elements: elements.len(),
            scanned_routes: routes.len(),
            per_agent: BTreeMap::new(),
        };
        for wf in by_id.into_values() {
            validate_definition(&wf)?;
            let agent = self.config.agents.for_category(wf.category).to_string();
            *report.per_agent.entry(agent.clone()).or_insert(0) += 1;
            catalog.entry(agent).or_default().push(wf);
        }

        tracing::info!(
            "[Discoverer] {} element(s), {} route(s) scanned; {} workflow(s) across {} agent(s)",
            report.scanned_elements,
            report.scanned_routes,
            report.per_agent.values().sum::<usize>(),
            report.per_agent.len()
        );
        Ok((catalog, report))
    }
}

// ─── Curated flows ────────────────────────────────────────────────────────

fn integration_step(
    action: &str,
    service: &str,
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
    rule: &str,
    validation: &str,
) -> WorkflowStep {
    WorkflowStep {
        action: action.to_string(),
        kind: StepKind::Integration(IntegrationStep {
            service: service.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            body,
            rule: rule.to_string(),
        }),
        validation: validation.to_string(),
    }
}

/// Hand-written critical UI paths of the quoting application.
pub fn curated_ui_flows() -> Vec<WorkflowDefinition> {
    vec![
        WorkflowDefinition {
            id: "ui-create-quote-e2e".to_string(),
            description: "Create a quote end to end: customer, unit, calculation".to_string(),
            category: WorkflowCategory::Ui,
            critical_path: true,
            expected_duration_ms: Some(30_000),
            dependencies: vec![],
            steps: vec![
                WorkflowStep::ui("navigate", "#customerSearch", Some("/"), "quote builder loads"),
                WorkflowStep::ui(
                    "search-customer",
                    "#customerSearch",
                    Some("Energen Test Customer"),
                    "customer suggestions appear",
                ),
                WorkflowStep::ui(
                    "enrich-customer",
                    "#enrichCustomerBtn",
                    None,
                    "address fields populated",
                ),
                WorkflowStep::ui("fill", "#unit-1-kw", Some("150"), "kW accepted"),
                WorkflowStep::ui("calculate", "#calculateBtn", None, "service prices rendered"),
                WorkflowStep::ui("assert-text", "#quoteTotal", Some("$"), "quote total shown"),
            ],
        },
        WorkflowDefinition {
            id: "ui-add-second-unit".to_string(),
            description: "Add a second generator unit to a quote".to_string(),
            category: WorkflowCategory::Ui,
            critical_path: true,
            expected_duration_ms: Some(15_000),
            dependencies: vec![],
            steps: vec![
                WorkflowStep::ui("navigate", "#addUnitBtn", Some("/"), "quote builder loads"),
                WorkflowStep::ui("add-unit", "#addUnitBtn", None, "second unit card appears"),
                WorkflowStep::ui("assert-visible", "#unit-2", None, "unit 2 rendered"),
                WorkflowStep::ui("fill", "#unit-2-kw", Some("60"), "kW accepted"),
                WorkflowStep::ui("calculate", "#calculateBtn", None, "both units priced"),
            ],
        },
        WorkflowDefinition {
            id: "ui-generate-pdf".to_string(),
            description: "Generate the quote PDF from a priced quote".to_string(),
            category: WorkflowCategory::Ui,
            critical_path: false,
            expected_duration_ms: Some(20_000),
            dependencies: vec!["ui-create-quote-e2e".to_string()],
            steps: vec![
                WorkflowStep::ui("navigate", "#generatePdfBtn", Some("/"), "quote builder loads"),
                WorkflowStep::ui("click", "#generatePdfBtn", None, "pdf generation starts"),
                WorkflowStep::ui("wait-for", "#pdfStatus", None, "pdf status reported"),
            ],
        },
    ]
}

/// Hand-authored cross-system flows; these cannot be inferred from source.
pub fn curated_integration_flows() -> Vec<WorkflowDefinition> {
    vec![
        WorkflowDefinition {
            id: "int-zoho-account-sync".to_string(),
            description: "Find or create the customer account in Zoho CRM".to_string(),
            category: WorkflowCategory::Integration,
            critical_path: true,
            expected_duration_ms: Some(5_000),
            dependencies: vec![],
            steps: vec![integration_step(
                "sync-account",
                "zoho",
                "POST",
                "/api/zoho/search-customer",
                Some(json!({ "name": "Energen Test Customer" })),
                "zoho_record",
                "account record with an id",
            )],
        },
        WorkflowDefinition {
            id: "int-zoho-invoice-create".to_string(),
            description: "Create a Zoho Books invoice for the synced account".to_string(),
            category: WorkflowCategory::Integration,
            critical_path: true,
            expected_duration_ms: Some(8_000),
            dependencies: vec!["int-zoho-account-sync".to_string()],
            steps: vec![integration_step(
                "create-invoice",
                "zoho",
                "POST",
                "/api/zoho/create-invoice",
                Some(json!({ "customerName": "Energen Test Customer", "lineItems": [] })),
                "zoho_record",
                "invoice record with an id",
            )],
        },
        WorkflowDefinition {
            id: "int-fullbay-customer-lookup".to_string(),
            description: "Look up the customer in Fullbay".to_string(),
            category: WorkflowCategory::Integration,
            critical_path: false,
            expected_duration_ms: Some(5_000),
            dependencies: vec![],
            steps: vec![integration_step(
                "lookup-customer",
                "fullbay",
                "GET",
                "/api/fullbay/customers?search=Energen",
                None,
                "fullbay_record",
                "customer list returned",
            )],
        },
        WorkflowDefinition {
            id: "int-places-enrichment".to_string(),
            description: "Enrich a customer address through Google Places".to_string(),
            category: WorkflowCategory::Integration,
            critical_path: false,
            expected_duration_ms: Some(5_000),
            dependencies: vec![],
            steps: vec![integration_step(
                "enrich-customer",
                "google_places",
                "POST",
                "/api/enrich-customer",
                Some(json!({ "companyName": "Energen Test Customer" })),
                "places_result",
                "formatted address returned",
            )],
        },
        WorkflowDefinition {
            id: "int-quote-pdf".to_string(),
            description: "Calculate a quote and render its PDF".to_string(),
            category: WorkflowCategory::Integration,
            critical_path: true,
            expected_duration_ms: Some(15_000),
            dependencies: vec![],
            steps: vec![
                integration_step(
                    "calculate",
                    "calculator",
                    "POST",
                    "/api/calculate",
                    Some(json!({ "kw": 150, "services": ["A", "B"] })),
                    "calculation_total",
                    "numeric total returned",
                ),
                integration_step(
                    "generate-pdf",
                    "pdf",
                    "POST",
                    "/api/generate-pdf",
                    Some(json!({ "quoteData": { "generators": [{ "kw": 150 }] } })),
                    "pdf_document",
                    "pdf document produced",
                ),
            ],
        },
    ]
}
