//! Minimal Chrome DevTools Protocol client.
//!
//! Targets are discovered over HTTP (`GET {cdp_url}/json`); commands and
//! events travel over the page target's WebSocket.

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// One entry of the `/json` target list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CdpError {
    #[error(
        "Chromium remote debugging not available. Ensure Chromium is running with --remote-debugging-port=9222"
    )]
    Unavailable,
    #[error("No Chromium tabs available")]
    NoTabs,
    #[error("DevTools connection failed: {0}")]
    Connection(String),
    #[error("DevTools protocol error: {0}")]
    Protocol(String),
    #[error("DevTools connection closed")]
    Closed,
}

/// Fetch the target list.
pub async fn list_targets(http: &reqwest::Client, cdp_url: &str) -> Result<Vec<Target>, CdpError> {
    let url = format!("{}/json", cdp_url.trim_end_matches('/'));
    let response = http
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|_| CdpError::Unavailable)?;
    if !response.status().is_success() {
        return Err(CdpError::Unavailable);
    }
    response
        .json()
        .await
        .map_err(|e| CdpError::Protocol(format!("bad target list: {e}")))
}

/// The first page target that accepts a debugger connection.
pub fn first_page(targets: &[Target]) -> Option<&Target> {
    targets
        .iter()
        .find(|t| t.kind == "page" && t.web_socket_debugger_url.is_some())
}

/// Connect to the first page of the browser at `cdp_url`.
pub async fn connect_first_page(http: &reqwest::Client, cdp_url: &str) -> Result<CdpSession, CdpError> {
    let targets = list_targets(http, cdp_url).await?;
    let page = first_page(&targets).ok_or(CdpError::NoTabs)?;
    let ws_url = page.web_socket_debugger_url.as_deref().ok_or(CdpError::NoTabs)?;
    debug!(target = %page.id, url = %page.url, "Attaching to page target");
    CdpSession::connect(ws_url).await
}

/// A WebSocket session with one target.
pub struct CdpSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    /// Events that arrived while waiting for a command response.
    pending_events: VecDeque<Value>,
}

impl CdpSession {
    pub async fn connect(ws_url: &str) -> Result<Self, CdpError> {
        let (ws, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| CdpError::Connection(e.to_string()))?;
        Ok(Self {
            ws,
            next_id: 0,
            pending_events: VecDeque::new(),
        })
    }

    /// Send a command and wait for its response. Returns the `result`
    /// object; a protocol-level `error` becomes `CdpError::Protocol`.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, CdpError> {
        self.next_id += 1;
        let id = self.next_id;
        let payload = json!({"id": id, "method": method, "params": params}).to_string();
        self.ws
            .send(WsMessage::Text(payload.into()))
            .await
            .map_err(|e| CdpError::Connection(e.to_string()))?;

        loop {
            let message = self.read_json().await?;
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                if let Some(error) = message.get("error") {
                    let text = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    return Err(CdpError::Protocol(text.to_string()));
                }
                return Ok(message.get("result").cloned().unwrap_or(Value::Null));
            }
            if message.get("method").is_some() {
                self.pending_events.push_back(message);
            }
        }
    }

    /// The next protocol event (`{method, params}`).
    pub async fn next_event(&mut self) -> Result<Value, CdpError> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        loop {
            let message = self.read_json().await?;
            if message.get("method").is_some() {
                return Ok(message);
            }
        }
    }

    async fn read_json(&mut self) -> Result<Value, CdpError> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| CdpError::Protocol(format!("bad message: {e}")));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err(CdpError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(CdpError::Connection(e.to_string())),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// A scripted DevTools endpoint for tests.
#[cfg(test)]
pub(crate) mod fake {
    use axum::extract::State;
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::sync::Arc;

    /// Maps `(method, params)` to `{"result": ..}` or `{"error": ..}`.
    pub type Responder = fn(&str, &Value) -> Value;

    #[derive(Clone)]
    struct Browser {
        ws_url: String,
        respond: Responder,
        /// Sent after the reply to `Network.enable`.
        network_events: Arc<Vec<Value>>,
    }

    async fn targets(State(browser): State<Browser>) -> Json<Value> {
        Json(json!([
            {"id": "sw", "type": "service_worker", "url": "https://example.com/sw.js"},
            {"id": "page-1", "type": "page", "url": "https://example.com", "title": "Example",
             "webSocketDebuggerUrl": browser.ws_url}
        ]))
    }

    async fn devtools(ws: WebSocketUpgrade, State(browser): State<Browser>) -> impl IntoResponse {
        ws.on_upgrade(move |socket| session(socket, browser))
    }

    async fn session(mut socket: WebSocket, browser: Browser) {
        while let Some(Ok(message)) = socket.recv().await {
            let Message::Text(text) = message else { continue };
            let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else { continue };
            let method = request["method"].as_str().unwrap_or_default().to_string();
            let mut reply = (browser.respond)(&method, &request["params"]);
            reply["id"] = request["id"].clone();
            if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                return;
            }
            if method == "Network.enable" {
                for event in browser.network_events.iter() {
                    if socket.send(Message::Text(event.to_string().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Start a fake browser; returns its `cdp_url`.
    pub async fn spawn(respond: Responder, network_events: Vec<Value>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let browser = Browser {
            ws_url: format!("ws://{addr}/devtools/page/page-1"),
            respond,
            network_events: Arc::new(network_events),
        };
        let app = Router::new()
            .route("/json", get(targets))
            .route("/devtools/page/page-1", get(devtools))
            .with_state(browser);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}
