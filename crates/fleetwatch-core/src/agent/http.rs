//! HTTP-driving worker for `api` and `integration` steps.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use super::validators::check_rule;
use super::{Agent, AgentError, WorkerLayer};
use crate::evidence::{StepEvidence, ValidationFinding};
use crate::workflow::{StepKind, WorkflowDefinition, WorkflowStep};

/// Error detail keeps at most this many characters of a response body.
pub const ERROR_BODY_LIMIT: usize = 500;

/// Recorded responses keep at most this many characters of a text body.
const RESPONSE_TEXT_LIMIT: usize = 4_000;

/// Outcome of one request, before it becomes step evidence.
struct Exchange {
    success: bool,
    response: Option<Value>,
    error: Option<String>,
    validation: Vec<ValidationFinding>,
}

impl Exchange {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error),
            validation: vec![],
        }
    }
}

pub struct HttpAgent {
    name: String,
    layer: WorkerLayer,
    base_url: String,
    timeout: Duration,
    client: Option<reqwest::Client>,
}

impl HttpAgent {
    pub fn new(name: &str, layer: WorkerLayer, base_url: &str) -> Self {
        Self {
            name: name.to_string(),
            layer,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            client: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        rule: Option<&str>,
    ) -> Exchange {
        let Some(client) = self.client.as_ref() else {
            return Exchange::failed("HTTP client not initialized".to_string());
        };
        let method = match reqwest::Method::from_bytes(method.to_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return Exchange::failed(format!("invalid HTTP method '{}'", method));
            }
        };

        let mut req = client.request(method, self.url_for(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let kind = if e.is_timeout() { "timeout" } else { "request failed" };
                return Exchange::failed(format!("{}: {}", kind, e));
            }
        };

        let status = resp.status();
        let text = match resp.bytes().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Err(e) => return Exchange::failed(format!("reading body: {}", e)),
        };

        if !status.is_success() {
            let detail = format!("HTTP {}: {}", status.as_u16(), truncate_chars(&text, ERROR_BODY_LIMIT));
            return Exchange::failed(detail);
        }

        let value = serde_json::from_str::<Value>(&text)
            .unwrap_or_else(|_| Value::String(truncate_chars(&text, RESPONSE_TEXT_LIMIT)));
        let findings = rule.map(|r| vec![check_rule(r, &value)]).unwrap_or_default();
        for finding in findings.iter().filter(|f| !f.passed) {
            tracing::info!(
                "[Agent:{}] advisory: {} on {}: {}",
                self.name,
                finding.rule,
                path,
                finding.detail
            );
        }
        Exchange {
            success: true,
            response: Some(value),
            error: None,
            validation: findings,
        }
    }
}

/// First `limit` characters of `text`, never splitting a character.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer(&self) -> WorkerLayer {
        self.layer
    }

    async fn initialize(&mut self) -> Result<(), AgentError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| AgentError::Init {
                agent: self.name.clone(),
                message: e.to_string(),
            })?;
        self.client = Some(client);
        tracing::info!("[Agent:{}] HTTP worker targeting {}", self.name, self.base_url);
        Ok(())
    }

    async fn run_step(
        &mut self,
        _workflow: &WorkflowDefinition,
        index: usize,
        step: &WorkflowStep,
    ) -> StepEvidence {
        let started = Instant::now();
        let exchange = match &step.kind {
            StepKind::Api(api) => {
                self.request(&api.method, &api.path, api.body.as_ref(), api.rule.as_deref())
                    .await
            }
            StepKind::Integration(int) => {
                self.request(&int.method, &int.path, int.body.as_ref(), Some(&int.rule))
                    .await
            }
            StepKind::Ui(_) => Exchange::failed(format!(
                "unsupported step type 'ui' for HTTP worker (action '{}')",
                step.action
            )),
        };
        StepEvidence {
            index,
            action: step.action.clone(),
            target: step.kind.target(),
            success: exchange.success,
            response: exchange.response,
            error: exchange.error,
            validation: exchange.validation,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn shutdown(&mut self) {
        self.client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRuntime, MemoryStatusChannel};
    use crate::config::FleetPaths;
    use crate::workflow::{write_catalog, ApiStep, Catalog, WorkflowCategory};
    use axum::{http::StatusCode, routing::get, routing::post, Json, Router};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn serve() -> String {
        let app = Router::new()
            .route("/api/health", get(|| async { Json(json!({"ok": true})) }))
            .route(
                "/api/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Json(json!({"ok": true}))
                }),
            )
            .route(
                "/api/calculate",
                post(|| async {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("calculator exploded: {}", "x".repeat(2_000)),
                    )
                }),
            )
            .route(
                "/api/zoho/search-customer",
                post(|| async { Json(json!({"message": "no id here"})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn step(method: &str, path: &str, rule: Option<&str>) -> WorkflowStep {
        WorkflowStep {
            action: "call".to_string(),
            kind: StepKind::Api(ApiStep {
                method: method.to_string(),
                path: path.to_string(),
                body: (method == "POST").then(|| json!({})),
                rule: rule.map(str::to_string),
            }),
            validation: "2xx".to_string(),
        }
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé…");
    }

    #[tokio::test]
    async fn test_server_error_fails_step_at_k() {
        let base = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let paths = FleetPaths::new(dir.path());

        let workflow = WorkflowDefinition {
            id: "api-three-steps".to_string(),
            description: String::new(),
            category: WorkflowCategory::Api,
            critical_path: true,
            expected_duration_ms: None,
            dependencies: vec![],
            steps: vec![
                step("GET", "/api/health", None),
                step("POST", "/api/calculate", None),
                step("GET", "/api/health", None),
            ],
        };
        let mut catalog = Catalog::new();
        catalog.insert("api-agent".to_string(), vec![workflow]);
        write_catalog(&paths.workflows_dir(), &catalog).await.unwrap();

        let agent = HttpAgent::new("api-agent", WorkerLayer::Api, &base);
        let mut rt = AgentRuntime::new(
            agent,
            paths,
            Arc::new(MemoryStatusChannel::new()),
            CancellationToken::new(),
        );
        rt.initialize().await.unwrap();
        let summary = rt.run_all_workflows().await.unwrap();
        let result = &summary.results[0];
        assert!(!result.passed);

        let record = rt.evidence_store().load(result.evidence.as_ref().unwrap()).unwrap();
        assert_eq!(record.steps.len(), 2);
        assert!(record.steps[0].success);
        let failed = &record.steps[1];
        assert!(!failed.success);
        let error = failed.error.as_ref().unwrap();
        assert!(error.starts_with("HTTP 500: calculator exploded"));
        assert!(error.chars().count() < 600);
        assert!(!record.passed);
    }

    #[tokio::test]
    async fn test_soft_validation_does_not_fail_step() {
        let base = serve().await;
        let mut agent = HttpAgent::new("integration-agent", WorkerLayer::Integration, &base);
        agent.initialize().await.unwrap();

        let workflow = WorkflowDefinition {
            id: "int-zoho".to_string(),
            description: String::new(),
            category: WorkflowCategory::Integration,
            critical_path: false,
            expected_duration_ms: None,
            dependencies: vec![],
            steps: vec![step("POST", "/api/zoho/search-customer", Some("zoho_record"))],
        };
        let evidence = agent.run_step(&workflow, 1, &workflow.steps[0]).await;
        assert!(evidence.success);
        assert_eq!(evidence.validation.len(), 1);
        assert!(!evidence.validation[0].passed);
        assert_eq!(evidence.response.unwrap()["message"], "no id here");
    }

    #[tokio::test]
    async fn test_slow_endpoint_is_diagnosed_as_timeout() {
        use crate::evidence::StepEvidence;
        use crate::healing::{classify, FailureTicket, Inventory, RootCause};

        let base = serve().await;
        let mut agent = HttpAgent::new("api-agent", WorkerLayer::Api, &base)
            .with_timeout(Duration::from_millis(200));
        agent.initialize().await.unwrap();

        let workflow = WorkflowDefinition {
            id: "api-slow".to_string(),
            description: String::new(),
            category: WorkflowCategory::Api,
            critical_path: false,
            expected_duration_ms: None,
            dependencies: vec![],
            steps: vec![step("GET", "/api/slow", None)],
        };
        let evidence: StepEvidence = agent.run_step(&workflow, 1, &workflow.steps[0]).await;
        assert!(!evidence.success);
        let error = evidence.error.clone().unwrap();
        assert!(error.starts_with("timeout:"), "{}", error);

        let ticket = FailureTicket {
            id: "api-slow--20260101T000000000Z".to_string(),
            workflow_id: workflow.id.clone(),
            agent: "api-agent".to_string(),
            category: WorkflowCategory::Api,
            evidence: std::path::PathBuf::from("evidence/api-slow.json"),
            failed_step: Some(evidence),
            error: None,
            detected_at: chrono::Utc::now(),
        };
        assert_eq!(classify(&ticket, &Inventory::default()).cause, RootCause::Timeout);
    }

    #[tokio::test]
    async fn test_ui_step_is_unsupported() {
        let mut agent = HttpAgent::new("api-agent", WorkerLayer::Api, "http://127.0.0.1:9");
        agent.initialize().await.unwrap();
        let workflow = WorkflowDefinition {
            id: "x".to_string(),
            description: String::new(),
            category: WorkflowCategory::Ui,
            critical_path: false,
            expected_duration_ms: None,
            dependencies: vec![],
            steps: vec![WorkflowStep::ui("click", "#a", None, "")],
        };
        let evidence = agent.run_step(&workflow, 1, &workflow.steps[0]).await;
        assert!(!evidence.success);
        assert!(evidence.error.unwrap().contains("unsupported"));
    }

    #[test]
    fn test_url_for() {
        let agent = HttpAgent::new("a", WorkerLayer::Api, "http://localhost:3002/");
        assert_eq!(agent.url_for("/api/x"), "http://localhost:3002/api/x");
        assert_eq!(agent.url_for("api/x"), "http://localhost:3002/api/x");
        assert_eq!(agent.url_for("https://other/x"), "https://other/x");
    }
}
