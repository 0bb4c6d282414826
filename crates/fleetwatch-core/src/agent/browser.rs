//! Browser-driving worker for `ui` steps.
//!
//! Each worker launches and exclusively owns one headless Chrome with its
//! own profile directory and debugging port. Step actions map to small
//! scripts evaluated in the page; every script resolves to
//! `{ ok: bool, detail: string }`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::{Child, Command};

use super::cdp::{page_ws_url, CdpSession};
use super::{Agent, AgentError, WorkerLayer};
use crate::evidence::StepEvidence;
use crate::fsutil;
use crate::workflow::{StepKind, UiStep, WorkflowDefinition, WorkflowStep};

/// Containers that show customer search hits.
const SEARCH_RESULT_SELECTOR: &str =
    "[data-customer-result], .customer-result, .search-result, .suggestion, .autocomplete-item";
/// Repeated generator-unit cards.
const UNIT_CARD_SELECTOR: &str = "[data-unit], .unit-card, .generator-unit";
/// Where a calculated quote total is rendered.
/// Extra time a protocol call waits beyond the in-page deadline, so a
/// script that gives up reports its own failure.
const PROTOCOL_HEADROOM: Duration = Duration::from_secs(2);

const TOTAL_SELECTOR: &str = "#quoteTotal, .quote-total, [data-total]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAction {
    Navigate,
    Click,
    Fill,
    Select,
    AssertVisible,
    AssertText,
    WaitFor,
    SearchCustomer,
    EnrichCustomer,
    AddUnit,
    Calculate,
}

impl FromStr for UiAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "navigate" => Ok(Self::Navigate),
            "click" => Ok(Self::Click),
            "fill" => Ok(Self::Fill),
            "select" => Ok(Self::Select),
            "assert-visible" => Ok(Self::AssertVisible),
            "assert-text" => Ok(Self::AssertText),
            "wait-for" => Ok(Self::WaitFor),
            "search-customer" => Ok(Self::SearchCustomer),
            "enrich-customer" => Ok(Self::EnrichCustomer),
            "add-unit" => Ok(Self::AddUnit),
            "calculate" => Ok(Self::Calculate),
            other => Err(format!("unsupported step action '{}'", other)),
        }
    }
}

fn js_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Wrap a script body in an async IIFE with `el`, `sel`, `val` in scope.
/// `poll(check)` retries `check` until it returns a result or `timeout_ms`
/// elapses.
fn wrap(selector: &str, value: Option<&str>, timeout_ms: u128, body: &str) -> String {
    format!(
        r#"(async () => {{
  const sel = {sel};
  const val = {val};
  const deadline = Date.now() + {timeout};
  const sleep = (ms) => new Promise((r) => setTimeout(r, ms));
  const visible = (e) => {{
    if (!e) return false;
    const s = getComputedStyle(e);
    const r = e.getBoundingClientRect();
    return s.display !== 'none' && s.visibility !== 'hidden' && r.width > 0 && r.height > 0;
  }};
  const poll = async (check, failure) => {{
    while (Date.now() < deadline) {{
      const res = await check();
      if (res) return res;
      await sleep(100);
    }}
    return {{ ok: false, detail: failure }};
  }};
  const el = document.querySelector(sel);
{body}
}})()"#,
        sel = js_str(selector),
        val = value.map(js_str).unwrap_or_else(|| "null".to_string()),
        timeout = timeout_ms,
        body = body,
    )
}

const REQUIRE_EL: &str =
    "  if (!el) return { ok: false, detail: 'selector not found: ' + sel };\n";

const FILL: &str = r#"  el.focus();
  el.value = val ?? '';
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
"#;

impl UiAction {
    /// The page script for this action. `Navigate` only waits for its
    /// ready selector; the navigation itself is a protocol command.
    pub fn script(&self, selector: &str, value: Option<&str>, timeout: Duration) -> String {
        let t = timeout.as_millis();
        let body = match self {
            UiAction::Navigate | UiAction::WaitFor => r#"  return poll(
    () => visible(document.querySelector(sel)) && { ok: true, detail: 'visible: ' + sel },
    'timed out waiting for ' + sel
  );"#
            .to_string(),
            UiAction::Click => format!(
                "{}  el.click();\n  return {{ ok: true, detail: 'clicked ' + sel }};",
                REQUIRE_EL
            ),
            UiAction::Fill => format!(
                "{}{}  return {{ ok: el.value === (val ?? ''), detail: 'value=' + el.value }};",
                REQUIRE_EL, FILL
            ),
            UiAction::Select => format!(
                r#"{}  const opt = Array.from(el.options || []).find((o) => o.value === val || o.text === val);
  if (!opt) return {{ ok: false, detail: 'no option ' + val + ' in ' + sel }};
  el.value = opt.value;
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return {{ ok: true, detail: 'selected ' + opt.value }};"#,
                REQUIRE_EL
            ),
            UiAction::AssertVisible => format!(
                "{}  return {{ ok: visible(el), detail: visible(el) ? 'visible' : 'not visible: ' + sel }};",
                REQUIRE_EL
            ),
            UiAction::AssertText => format!(
                r#"{}  const text = (el.innerText || el.value || '').trim();
  return {{ ok: text.includes(val ?? ''), detail: 'text=' + text.slice(0, 200) }};"#,
                REQUIRE_EL
            ),
            UiAction::SearchCustomer => format!(
                r#"{}{}  el.dispatchEvent(new KeyboardEvent('keyup', {{ bubbles: true, key: 'Enter' }}));
  const results = {results};
  return poll(
    () => {{
      const n = document.querySelectorAll(results).length;
      return n > 0 && {{ ok: true, detail: n + ' customer result(s)' }};
    }},
    'no customer results appeared'
  );"#,
                REQUIRE_EL,
                FILL,
                results = js_str(SEARCH_RESULT_SELECTOR)
            ),
            UiAction::EnrichCustomer => format!(
                r#"{}  el.click();
  await sleep(100);
  return poll(
    () => !el.disabled && !el.classList.contains('loading') && {{ ok: true, detail: 'enrichment finished' }},
    'enrichment did not finish'
  );"#,
                REQUIRE_EL
            ),
            UiAction::AddUnit => format!(
                r#"{}  const cards = {cards};
  const before = document.querySelectorAll(cards).length;
  el.click();
  return poll(
    () => {{
      const after = document.querySelectorAll(cards).length;
      return after > before && {{ ok: true, detail: after + ' unit(s)' }};
    }},
    'unit count did not increase'
  );"#,
                REQUIRE_EL,
                cards = js_str(UNIT_CARD_SELECTOR)
            ),
            UiAction::Calculate => format!(
                r#"{}  el.click();
  const totals = {totals};
  return poll(
    () => {{
      const t = document.querySelector(totals);
      const text = t ? (t.innerText || '').trim() : '';
      return /\d/.test(text) && {{ ok: true, detail: 'total ' + text }};
    }},
    'no quote total rendered'
  );"#,
                REQUIRE_EL,
                totals = js_str(TOTAL_SELECTOR)
            ),
        };
        wrap(selector, value, t, &body)
    }
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Chrome/Chromium binary
    pub chrome_path: String,
    pub base_url: String,
    /// Remote-debugging port; 0 lets the browser pick a free one
    pub debug_port: u16,
    pub headless: bool,
    /// Settle time between steps
    pub step_delay: Duration,
    /// Upper bound for one action, including its waits
    pub action_timeout: Duration,
    pub launch_timeout: Duration,
    pub screenshot_dir: PathBuf,
    /// Private profile directory, removed on shutdown
    pub profile_dir: PathBuf,
}

impl BrowserConfig {
    pub fn new(base_url: &str, screenshot_dir: PathBuf, profile_dir: PathBuf) -> Self {
        Self {
            chrome_path: std::env::var("CHROME_PATH").unwrap_or_else(|_| "google-chrome".to_string()),
            base_url: base_url.trim_end_matches('/').to_string(),
            debug_port: 0,
            headless: true,
            step_delay: Duration::from_millis(500),
            action_timeout: Duration::from_secs(15),
            launch_timeout: Duration::from_secs(20),
            screenshot_dir,
            profile_dir,
        }
    }

    /// Deadline for one remote-debugging call. Always outlasts
    /// `action_timeout`.
    pub fn protocol_timeout(&self) -> Duration {
        self.action_timeout + PROTOCOL_HEADROOM
    }
}

/// Turn a page script's `{ok, detail}` result into a step outcome.
fn script_outcome(result: Value) -> Result<Value, String> {
    match result.get("ok").and_then(Value::as_bool) {
        Some(true) => Ok(result),
        Some(false) => Err(result["detail"]
            .as_str()
            .unwrap_or("action failed")
            .to_string()),
        None => Err(format!("unexpected script result: {}", result)),
    }
}

pub struct BrowserAgent {
    name: String,
    config: BrowserConfig,
    chrome: Option<Child>,
    session: Option<CdpSession>,
}

impl BrowserAgent {
    pub fn new(name: &str, config: BrowserConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            chrome: None,
            session: None,
        }
    }

    fn init_error(&self, message: impl Into<String>) -> AgentError {
        AgentError::Init {
            agent: self.name.clone(),
            message: message.into(),
        }
    }

    async fn launch(&mut self) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.config.profile_dir)
            .await
            .map_err(|e| self.init_error(format!("profile dir: {}", e)))?;
        let port_file = self.config.profile_dir.join("DevToolsActivePort");
        let _ = tokio::fs::remove_file(&port_file).await;

        let mut cmd = Command::new(&self.config.chrome_path);
        if self.config.headless {
            cmd.arg("--headless=new");
        }
        cmd.arg(format!("--remote-debugging-port={}", self.config.debug_port))
            .arg(format!("--user-data-dir={}", self.config.profile_dir.display()))
            .args([
                "--no-first-run",
                "--no-default-browser-check",
                "--disable-gpu",
                "--window-size=1366,900",
                "about:blank",
            ])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|e| {
            self.init_error(format!(
                "failed to launch '{}': {}. Set CHROME_PATH to a Chrome/Chromium binary",
                self.config.chrome_path, e
            ))
        })?;
        tracing::info!(
            "[Agent:{}] Launched browser (pid {:?})",
            self.name,
            child.id()
        );
        self.chrome = Some(child);

        let port = match self.config.debug_port {
            0 => self.read_port_file(&port_file).await?,
            port => port,
        };
        let ws = page_ws_url(port, self.config.launch_timeout)
            .await
            .map_err(|e| self.init_error(e.to_string()))?;
        let session = CdpSession::connect(&ws, self.config.protocol_timeout())
            .await
            .map_err(|e| self.init_error(e.to_string()))?;
        session
            .call("Page.enable", json!({}))
            .await
            .map_err(|e| self.init_error(e.to_string()))?;
        self.session = Some(session);
        Ok(())
    }

    /// The browser writes its chosen port on the first line of
    /// `DevToolsActivePort` in the profile directory.
    async fn read_port_file(&self, path: &std::path::Path) -> Result<u16, AgentError> {
        let deadline = tokio::time::Instant::now() + self.config.launch_timeout;
        loop {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                if let Some(port) = content.lines().next().and_then(|l| l.trim().parse().ok()) {
                    return Ok(port);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(self.init_error(format!(
                    "browser did not report a debugging port within {:?}",
                    self.config.launch_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn run_ui_step(&self, ui: &UiStep, action: UiAction) -> Result<Value, String> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| "browser session not initialized".to_string())?;

        if action == UiAction::Navigate {
            let target = ui.value.as_deref().unwrap_or("/");
            let url = if target.starts_with("http://") || target.starts_with("https://") {
                target.to_string()
            } else {
                format!("{}/{}", self.config.base_url, target.trim_start_matches('/'))
            };
            session.navigate(&url).await.map_err(|e| e.to_string())?;
        }

        let script = action.script(&ui.selector, ui.value.as_deref(), self.config.action_timeout);
        let result = session.evaluate(&script).await.map_err(|e| e.to_string())?;
        script_outcome(result)
    }
}

#[async_trait]
impl Agent for BrowserAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer(&self) -> WorkerLayer {
        WorkerLayer::Ui
    }

    async fn initialize(&mut self) -> Result<(), AgentError> {
        if let Err(e) = self.launch().await {
            self.shutdown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn run_step(
        &mut self,
        _workflow: &WorkflowDefinition,
        index: usize,
        step: &WorkflowStep,
    ) -> StepEvidence {
        let started = Instant::now();
        let outcome = match &step.kind {
            StepKind::Ui(ui) => match step.action.parse::<UiAction>() {
                Ok(action) => self.run_ui_step(ui, action).await,
                Err(e) => Err(e),
            },
            other => Err(format!(
                "unsupported step type '{}' for browser worker",
                other.category()
            )),
        };
        let (success, response, error) = match outcome {
            Ok(value) => (true, Some(value), None),
            Err(e) => (false, None, Some(e)),
        };
        StepEvidence {
            index,
            action: step.action.clone(),
            target: step.kind.target(),
            success,
            response,
            error,
            validation: vec![],
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn capture_failure(&mut self, workflow: &WorkflowDefinition, index: usize) -> Option<PathBuf> {
        let session = self.session.as_ref()?;
        let png = match session.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                tracing::warn!("[Agent:{}] Screenshot failed for {}: {}", self.name, workflow.id, e);
                return None;
            }
        };
        let file = format!(
            "{}--{}--step{}.png",
            workflow.id,
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            index
        );
        let path = self.config.screenshot_dir.join(file);
        match fsutil::write_atomic(&path, &png).await {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!("[Agent:{}] Could not save screenshot: {}", self.name, e);
                None
            }
        }
    }

    fn step_delay(&self) -> Duration {
        self.config.step_delay
    }

    async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        if let Some(mut child) = self.chrome.take() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            tracing::info!("[Agent:{}] Browser stopped", self.name);
        }
        if self.config.profile_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&self.config.profile_dir).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowCategory;

    fn agent(dir: &std::path::Path) -> BrowserAgent {
        let mut config = BrowserConfig::new(
            "http://localhost:3002",
            dir.join("shots"),
            dir.join("profile"),
        );
        config.chrome_path = "/definitely/not/a/browser".to_string();
        config.launch_timeout = Duration::from_millis(200);
        BrowserAgent::new("ui-agent", config)
    }

    fn ui_workflow(action: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "ui-flow".to_string(),
            description: String::new(),
            category: WorkflowCategory::Ui,
            critical_path: false,
            expected_duration_ms: None,
            dependencies: vec![],
            steps: vec![WorkflowStep::ui(action, "#calculateBtn", None, "")],
        }
    }

    #[test]
    fn test_action_names() {
        assert_eq!("search-customer".parse::<UiAction>(), Ok(UiAction::SearchCustomer));
        assert_eq!("assert-visible".parse::<UiAction>(), Ok(UiAction::AssertVisible));
        let err = "teleport".parse::<UiAction>().unwrap_err();
        assert_eq!(err, "unsupported step action 'teleport'");
    }

    #[test]
    fn test_scripts_escape_selector_and_value() {
        let script = UiAction::Fill.script(
            r#"input[name="kw"]"#,
            Some("it's \"150\""),
            Duration::from_secs(2),
        );
        assert!(script.contains(r#"const sel = "input[name=\"kw\"]";"#));
        assert!(script.contains(r#"const val = "it's \"150\"";"#));
        assert!(script.contains("Date.now() + 2000"));
        assert!(script.contains("dispatchEvent(new Event('input'"));

        let click = UiAction::Click.script("#a", None, Duration::from_secs(1));
        assert!(click.contains("const val = null;"));
        assert!(click.contains("el.click()"));
    }

    #[test]
    fn test_domain_scripts_wait_for_effects() {
        let t = Duration::from_secs(5);
        assert!(UiAction::AddUnit.script("#addUnitBtn", None, t).contains("unit count did not increase"));
        assert!(UiAction::Calculate.script("#calculateBtn", None, t).contains("#quoteTotal"));
        assert!(UiAction::SearchCustomer
            .script("#customerSearch", Some("Acme"), t)
            .contains("no customer results appeared"));
    }

    /// Stand-in debugger endpoint that answers every call only once the
    /// in-page wait would have given up.
    async fn slow_debugger(answer_after: Duration) -> String {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(&text).unwrap();
                tokio::time::sleep(answer_after).await;
                let reply = json!({
                    "id": request["id"],
                    "result": {"result": {"value": {
                        "ok": false,
                        "detail": "timed out waiting for #customerSearch"
                    }}}
                });
                if ws.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
            }
        });
        format!("ws://{}", addr)
    }

    #[test]
    fn test_protocol_timeout_outlasts_action_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BrowserConfig::new("http://localhost:3002", dir.path().join("s"), dir.path().join("p"));
        assert!(config.protocol_timeout() > config.action_timeout);
        config.action_timeout = Duration::from_millis(300);
        assert!(config.protocol_timeout() > Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_wait_failure_reports_script_detail() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BrowserConfig::new("http://localhost:3002", dir.path().join("s"), dir.path().join("p"));
        config.action_timeout = Duration::from_millis(300);

        let ws = slow_debugger(config.action_timeout).await;
        let session = CdpSession::connect(&ws, config.protocol_timeout()).await.unwrap();
        let script = UiAction::WaitFor.script("#customerSearch", None, config.action_timeout);
        let result = session.evaluate(&script).await.unwrap();
        assert_eq!(
            script_outcome(result).unwrap_err(),
            "timed out waiting for #customerSearch"
        );
        session.close().await;
    }

    #[test]
    fn test_script_outcome() {
        assert!(script_outcome(json!({"ok": true})).is_ok());
        assert_eq!(script_outcome(json!({"ok": false})).unwrap_err(), "action failed");
        assert!(script_outcome(json!(null)).unwrap_err().starts_with("unexpected script result"));
    }

    #[tokio::test]
    async fn test_unknown_action_fails_step_without_browser() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(dir.path());
        let wf = ui_workflow("teleport");
        let evidence = agent.run_step(&wf, 1, &wf.steps[0]).await;
        assert!(!evidence.success);
        assert_eq!(evidence.error.as_deref(), Some("unsupported step action 'teleport'"));
        assert!(agent.capture_failure(&wf, 1).await.is_none());
    }

    #[tokio::test]
    async fn test_launch_failure_is_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(dir.path());
        let err = agent.initialize().await.unwrap_err();
        assert!(matches!(err, AgentError::Init { .. }));
        assert!(err.to_string().contains("CHROME_PATH"));
        agent.shutdown().await;
        agent.shutdown().await;
    }
}
