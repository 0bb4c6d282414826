//! Analysis stage: root-cause classification with a confidence score.
//!
//! Classification is a pure function of the failure ticket and an
//! [`Inventory`] of what the target application currently exposes, so the
//! same failure always gets the same diagnosis.

use async_trait::async_trait;
use chrono::Utc;

use super::artifacts::{Analysis, FailureTicket, RootCause};
use super::queue::ArtifactQueue;
use super::{queues, HealingError, HealingStage};
use crate::config::FleetPaths;
use crate::workflow::discovery::{id_selector, ScannedRoute};
use crate::workflow::{Discoverer, DiscoveryConfig, DiscoveryError, WorkflowCategory};

/// Confidence of a drift whose replacement was located.
const DRIFT_LOCATED: f64 = 0.85;
/// Confidence of a drift with no plausible replacement.
const DRIFT_UNLOCATED: f64 = 0.35;
/// The element still exists, so the failure is more likely timing.
const DRIFT_PRESENT: f64 = 0.3;

/// Selectors and routes the application exposes right now.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub selectors: Vec<String>,
    /// Routes with path parameters already substituted
    pub routes: Vec<ScannedRoute>,
}

impl Inventory {
    pub fn scan(discoverer: &Discoverer) -> Result<Self, DiscoveryError> {
        let placeholder = discoverer.config().path_placeholder.clone();
        let selectors = discoverer
            .scan_elements()?
            .iter()
            .map(|e| id_selector(&e.id))
            .collect();
        let routes = discoverer
            .scan_routes()?
            .into_iter()
            .map(|r| ScannedRoute {
                path: substitute_params(&r.path, &placeholder),
                method: r.method,
            })
            .collect();
        Ok(Self { selectors, routes })
    }
}

fn substitute_params(path: &str, placeholder: &str) -> String {
    path.split('/')
        .map(|seg| if seg.starts_with(':') { placeholder } else { seg })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    pub cause: RootCause,
    pub hypothesis: String,
    pub confidence: f64,
}

impl Diagnosis {
    fn new(cause: RootCause, confidence: f64, hypothesis: String) -> Self {
        Self {
            cause,
            hypothesis,
            confidence,
        }
    }
}

/// Edit distance between two strings, by characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == *cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Closest candidate within a third of the needle's length (at least 2
/// edits). Ties go to the first candidate.
fn nearest<'a>(needle: &str, candidates: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let limit = (needle.chars().count() / 3).max(2);
    candidates
        .filter(|c| *c != needle)
        .map(|c| (levenshtein(needle, c), c))
        .filter(|(d, _)| *d <= limit)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c)
}

fn http_status(error: &str) -> Option<u16> {
    error
        .strip_prefix("HTTP ")
        .and_then(|rest| rest.get(..3))
        .and_then(|code| code.parse().ok())
}

/// Diagnose one failure. Rules are checked in order; the first match wins.
pub fn classify(ticket: &FailureTicket, inventory: &Inventory) -> Diagnosis {
    let error = ticket.error_text();
    let lower = error.to_lowercase();
    let target = ticket
        .failed_step
        .as_ref()
        .map(|s| s.target.clone())
        .unwrap_or_default();
    let action = ticket
        .failed_step
        .as_ref()
        .map(|s| s.action.clone())
        .unwrap_or_default();

    if lower.contains("unsupported step") {
        return Diagnosis::new(
            RootCause::UnsupportedAction { action },
            0.9,
            format!("workflow uses an action the worker cannot run: {}", error),
        );
    }

    // Client-side deadline: the request went out but no answer came back.
    if lower.starts_with("timeout:") {
        return Diagnosis::new(
            RootCause::Timeout,
            0.6,
            format!("{} did not respond in time", target),
        );
    }

    if lower.contains("connection refused")
        || lower.contains("error sending request")
        || lower.contains("err_connection")
    {
        return Diagnosis::new(
            RootCause::TargetDown,
            0.9,
            "application under test was not reachable".to_string(),
        );
    }

    if ticket.category == WorkflowCategory::Ui
        && (lower.contains("selector not found") || lower.contains("timed out waiting for"))
    {
        return classify_selector(&target, inventory);
    }

    if let Some(status) = http_status(error) {
        if status == 404 || status == 405 {
            return classify_endpoint(&target, inventory);
        }
        if status >= 500 {
            return Diagnosis::new(
                RootCause::ServerError { status },
                0.75,
                format!("server-side error on {}: {}", target, error),
            );
        }
    }

    if lower.contains("timeout") || lower.contains("timed out") {
        return Diagnosis::new(
            RootCause::Timeout,
            0.6,
            format!("{} did not respond in time", target),
        );
    }

    Diagnosis::new(
        RootCause::Unknown,
        0.1,
        format!("no rule explains: {}", error),
    )
}

fn classify_selector(selector: &str, inventory: &Inventory) -> Diagnosis {
    if inventory.selectors.iter().any(|s| s == selector) {
        return Diagnosis::new(
            RootCause::SelectorDrift {
                selector: selector.to_string(),
                replacement: None,
            },
            DRIFT_PRESENT,
            format!("{} still exists; likely a timing or visibility issue", selector),
        );
    }
    let replacement = nearest(selector, inventory.selectors.iter().map(String::as_str));
    let (confidence, hypothesis) = match replacement {
        Some(r) => (DRIFT_LOCATED, format!("{} was renamed to {}", selector, r)),
        None => (DRIFT_UNLOCATED, format!("{} no longer exists in the markup", selector)),
    };
    Diagnosis::new(
        RootCause::SelectorDrift {
            selector: selector.to_string(),
            replacement: replacement.map(str::to_string),
        },
        confidence,
        hypothesis,
    )
}

fn classify_endpoint(target: &str, inventory: &Inventory) -> Diagnosis {
    let (method, path) = target.split_once(' ').unwrap_or(("", target));
    let same_method = inventory
        .routes
        .iter()
        .filter(|r| r.method.eq_ignore_ascii_case(method))
        .map(|r| r.path.as_str());
    let replacement = nearest(path, same_method);
    let (confidence, hypothesis) = match replacement {
        Some(r) => (DRIFT_LOCATED, format!("{} {} moved to {}", method, path, r)),
        None => (DRIFT_UNLOCATED, format!("{} {} is not in the route table", method, path)),
    };
    Diagnosis::new(
        RootCause::EndpointDrift {
            method: method.to_string(),
            path: path.to_string(),
            replacement: replacement.map(str::to_string),
        },
        confidence,
        hypothesis,
    )
}

pub struct AnalysisStage {
    failures: ArtifactQueue<FailureTicket>,
    analyses: ArtifactQueue<Analysis>,
    review: ArtifactQueue<Analysis>,
    discoverer: Discoverer,
    threshold: f64,
}

impl AnalysisStage {
    pub fn new(paths: &FleetPaths, discovery: DiscoveryConfig, threshold: f64) -> Self {
        let healing = paths.healing_dir();
        Self {
            failures: ArtifactQueue::new(&healing, queues::FAILURES),
            analyses: ArtifactQueue::new(&healing, queues::ANALYSES),
            review: ArtifactQueue::new(&healing, queues::REVIEW),
            discoverer: Discoverer::new(discovery),
            threshold,
        }
    }
}

#[async_trait]
impl HealingStage for AnalysisStage {
    fn name(&self) -> &'static str {
        "analysis"
    }

    async fn run_once(&mut self) -> Result<usize, HealingError> {
        let mut handled = 0;
        let mut inventory: Option<Inventory> = None;

        while let Some(claimed) = self.failures.claim().await? {
            // Scan once per batch, and only when there is work.
            let discoverer = &self.discoverer;
            let current = inventory.get_or_insert_with(|| {
                Inventory::scan(discoverer).unwrap_or_else(|e| {
                    tracing::warn!("[Heal:analysis] Inventory scan failed: {}", e);
                    Inventory::default()
                })
            });
            let diagnosis = classify(&claimed.artifact, current);
            let needs_review = diagnosis.confidence < self.threshold;
            let analysis = Analysis {
                id: claimed.id.clone(),
                ticket: claimed.artifact.clone(),
                cause: diagnosis.cause,
                hypothesis: diagnosis.hypothesis,
                confidence: diagnosis.confidence,
                needs_review,
                analyzed_at: Utc::now(),
            };

            if needs_review {
                tracing::info!(
                    "[Heal:analysis] {} needs human review ({:.2}): {}",
                    analysis.ticket.workflow_id,
                    analysis.confidence,
                    analysis.hypothesis
                );
                self.review.enqueue(&analysis.id, &analysis).await?;
            } else {
                tracing::info!(
                    "[Heal:analysis] {} → {} ({:.2})",
                    analysis.ticket.workflow_id,
                    analysis.cause.label(),
                    analysis.confidence
                );
                self.analyses.enqueue(&analysis.id, &analysis).await?;
            }
            self.failures.complete(claimed).await?;
            handled += 1;
        }
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::StepEvidence;
    use crate::healing::QueueState;
    use std::path::PathBuf;

    fn ticket(category: WorkflowCategory, target: &str, error: &str) -> FailureTicket {
        FailureTicket {
            id: "wf--20260101T000000000Z".to_string(),
            workflow_id: "wf".to_string(),
            agent: "agent".to_string(),
            category,
            evidence: PathBuf::from("evidence/wf.json"),
            failed_step: Some(StepEvidence {
                index: 1,
                action: "click".to_string(),
                target: target.to_string(),
                success: false,
                response: None,
                error: Some(error.to_string()),
                validation: vec![],
                duration_ms: 5,
            }),
            error: None,
            detected_at: Utc::now(),
        }
    }

    fn inventory() -> Inventory {
        Inventory {
            selectors: vec!["#calculate-btn".into(), "#customer-search".into()],
            routes: vec![
                ScannedRoute { method: "POST".into(), path: "/api/calculate".into() },
                ScannedRoute { method: "GET".into(), path: "/api/customers/sample".into() },
            ],
        }
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_selector_drift_located() {
        let t = ticket(WorkflowCategory::Ui, "#calculate-button", "selector not found: #calculate-button");
        let d = classify(&t, &inventory());
        assert_eq!(
            d.cause,
            RootCause::SelectorDrift {
                selector: "#calculate-button".into(),
                replacement: Some("#calculate-btn".into())
            }
        );
        assert!(d.confidence >= 0.7);
    }

    #[test]
    fn test_selector_present_is_low_confidence() {
        let t = ticket(WorkflowCategory::Ui, "#calculate-btn", "timed out waiting for #calculate-btn");
        assert!(classify(&t, &inventory()).confidence < 0.7);
    }

    #[test]
    fn test_endpoint_drift_and_server_error() {
        let t = ticket(WorkflowCategory::Api, "POST /api/calculat", "HTTP 404: Not Found");
        let d = classify(&t, &inventory());
        assert_eq!(
            d.cause,
            RootCause::EndpointDrift {
                method: "POST".into(),
                path: "/api/calculat".into(),
                replacement: Some("/api/calculate".into())
            }
        );

        let t = ticket(WorkflowCategory::Api, "POST /api/calculate", "HTTP 503: down");
        assert_eq!(classify(&t, &inventory()).cause, RootCause::ServerError { status: 503 });
    }

    #[test]
    fn test_target_down_and_unknown() {
        let t = ticket(WorkflowCategory::Api, "GET /", "request failed: error sending request");
        assert_eq!(classify(&t, &inventory()).cause, RootCause::TargetDown);

        let t = ticket(WorkflowCategory::Api, "GET /api/quote", "total mismatch: expected 1200");
        let d = classify(&t, &inventory());
        assert_eq!(d.cause, RootCause::Unknown);
        assert!(d.confidence < 0.7);
    }

    #[test]
    fn test_client_timeout_is_not_target_down() {
        let t = ticket(
            WorkflowCategory::Api,
            "GET /api/slow",
            "timeout: error sending request for url (http://127.0.0.1:3002/api/slow)",
        );
        let d = classify(&t, &inventory());
        assert_eq!(d.cause, RootCause::Timeout);
        assert!(d.hypothesis.contains("GET /api/slow"));
    }

    #[test]
    fn test_wait_timeout_on_renamed_selector_is_drift() {
        let t = ticket(
            WorkflowCategory::Ui,
            "#customerSearch",
            "timed out waiting for #customerSearch",
        );
        let d = classify(&t, &inventory());
        assert_eq!(
            d.cause,
            RootCause::SelectorDrift {
                selector: "#customerSearch".into(),
                replacement: Some("#customer-search".into())
            }
        );
        assert!(d.confidence >= 0.7);
    }

    #[test]
    fn test_substitute_params() {
        assert_eq!(substitute_params("/api/customers/:id", "sample"), "/api/customers/sample");
    }

    #[tokio::test]
    async fn test_low_confidence_goes_to_review_without_patch() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FleetPaths::new(dir.path());
        let failures: ArtifactQueue<FailureTicket> = ArtifactQueue::new(&paths.healing_dir(), queues::FAILURES);
        let t = ticket(WorkflowCategory::Api, "GET /api/quote", "total mismatch: expected 1200");
        failures.enqueue(&t.id, &t).await.unwrap();

        let mut stage = AnalysisStage::new(&paths, DiscoveryConfig::default(), 0.7);
        assert_eq!(stage.run_once().await.unwrap(), 1);

        let review: ArtifactQueue<Analysis> = ArtifactQueue::new(&paths.healing_dir(), queues::REVIEW);
        let flagged = review.list(QueueState::Pending).unwrap();
        assert_eq!(flagged.len(), 1);
        assert!(flagged[0].needs_review);
        assert_eq!(flagged[0].cause, RootCause::Unknown);

        let analyses: ArtifactQueue<Analysis> = ArtifactQueue::new(&paths.healing_dir(), queues::ANALYSES);
        assert_eq!(analyses.count(QueueState::Pending), 0);
        assert_eq!(failures.count(QueueState::Done), 1);
    }
}
