//! CdpSession — a single Chrome DevTools Protocol connection over WebSocket.
//!
//! Requests carry an increasing `id`; a background reader resolves the
//! matching pending `oneshot` when the response arrives. Events (messages
//! without an `id`) are ignored: the browser worker only needs
//! request/response round-trips.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, CdpError>>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CdpError {
    #[error("CDP connect failed: {0}")]
    Connect(String),

    #[error("CDP error [{code}]: {message}")]
    Protocol { code: i64, message: String },

    #[error("Timeout waiting for {method} ({ms}ms)")]
    Timeout { method: String, ms: u128 },

    #[error("CDP session closed")]
    Closed,

    #[error("Script threw: {0}")]
    Evaluation(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Invalid CDP payload: {0}")]
    Decode(String),
}

pub struct CdpSession {
    sink: Arc<Mutex<WsSink>>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl CdpSession {
    /// Connect to a page target's `webSocketDebuggerUrl`.
    pub async fn connect(ws_url: &str, timeout: Duration) -> Result<Self, CdpError> {
        let (ws, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| CdpError::Connect(e.to_string()))?;
        let (sink, mut stream) = ws.split();

        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let pending_clone = pending.clone();
        let alive_clone = alive.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!("[Cdp] Read error: {}", e);
                        break;
                    }
                };
                let msg: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let Some(id) = msg.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                if let Some(tx) = pending_clone.lock().await.remove(&id) {
                    let result = match msg.get("error") {
                        Some(err) => Err(CdpError::Protocol {
                            code: err["code"].as_i64().unwrap_or(0),
                            message: err["message"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string(),
                        }),
                        None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(result);
                }
            }
            alive_clone.store(false, Ordering::SeqCst);
            for (_, tx) in pending_clone.lock().await.drain() {
                let _ = tx.send(Err(CdpError::Closed));
            }
        });

        tracing::debug!("[Cdp] Connected to {}", ws_url);
        Ok(Self {
            sink: Arc::new(Mutex::new(sink)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            timeout,
            reader_handle,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a CDP command and wait for its result.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        if !self.is_alive() {
            return Err(CdpError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = json!({ "id": id, "method": method, "params": params });
        let send = self
            .sink
            .lock()
            .await
            .send(Message::Text(msg.to_string()))
            .await;
        if let Err(e) = send {
            self.pending.lock().await.remove(&id);
            return Err(CdpError::Connect(format!("send {}: {}", method, e)));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CdpError::Timeout {
                    method: method.to_string(),
                    ms: self.timeout.as_millis(),
                })
            }
        }
    }

    /// Evaluate a script in the page and return its value. Promises are
    /// awaited; exceptions become [`CdpError::Evaluation`].
    pub async fn evaluate(&self, expression: &str) -> Result<Value, CdpError> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("exception")
                .to_string();
            return Err(CdpError::Evaluation(text));
        }
        Ok(result["result"].get("value").cloned().unwrap_or(Value::Null))
    }

    /// Navigate and wait until `document.readyState` is `complete`.
    pub async fn navigate(&self, url: &str) -> Result<(), CdpError> {
        let result = self.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(err) = result.get("errorText").and_then(Value::as_str) {
            if !err.is_empty() {
                return Err(CdpError::Navigation(format!("{}: {}", url, err)));
            }
        }
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            // The old document may still answer briefly after navigation starts.
            if let Ok(Value::String(state)) = self.evaluate("document.readyState").await {
                if state == "complete" {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CdpError::Timeout {
                    method: "Page.navigate".to_string(),
                    ms: self.timeout.as_millis(),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Full-page PNG screenshot.
    pub async fn screenshot(&self) -> Result<Vec<u8>, CdpError> {
        let result = self
            .call(
                "Page.captureScreenshot",
                json!({ "format": "png", "captureBeyondViewport": true }),
            )
            .await?;
        let data = result["data"]
            .as_str()
            .ok_or_else(|| CdpError::Decode("screenshot without data".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| CdpError::Decode(e.to_string()))
    }

    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(CdpError::Closed));
        }
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Ask the browser's HTTP endpoint for the first page target and return its
/// WebSocket debugger URL. Retries until `timeout` since the endpoint only
/// appears once the browser has started.
pub async fn page_ws_url(port: u16, timeout: Duration) -> Result<String, CdpError> {
    let url = format!("http://127.0.0.1:{}/json/list", port);
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_error = String::from("no page target");
    loop {
        match client.get(&url).send().await {
            Ok(resp) => match resp.json::<Vec<Value>>().await {
                Ok(targets) => {
                    let ws = targets
                        .iter()
                        .filter(|t| t["type"] == "page")
                        .find_map(|t| t["webSocketDebuggerUrl"].as_str());
                    if let Some(ws) = ws {
                        return Ok(ws.to_string());
                    }
                }
                Err(e) => last_error = e.to_string(),
            },
            Err(e) => last_error = e.to_string(),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CdpError::Connect(format!("{}: {}", url, last_error)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_page_ws_url_times_out_without_browser() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = page_ws_url(port, Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, CdpError::Connect(_)));
    }

    #[tokio::test]
    async fn test_page_ws_url_picks_page_target() {
        use axum::{routing::get, Json, Router};

        let app = Router::new().route(
            "/json/list",
            get(|| async {
                Json(json!([
                    {"type": "service_worker", "webSocketDebuggerUrl": "ws://sw"},
                    {"type": "page", "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/ABC"}
                ]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let ws = page_ws_url(port, Duration::from_secs(5)).await.unwrap();
        assert_eq!(ws, "ws://127.0.0.1:1/devtools/page/ABC");
    }
}
