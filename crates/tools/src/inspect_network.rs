//! Network inspector: capture outgoing browser requests over DevTools.
//!
//! Monitoring runs as a background task that owns the DevTools session and
//! appends every `Network.requestWillBeSent` event to a shared buffer.
//! The default `capture` action returns the most recent match together with
//! an `<inspector>` block that UIs parse.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tilt_core::error::ToolError;
use tilt_core::provider::ToolDefinition;
use tilt_core::tool::{Tool, ToolResult};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cdp::{self, CdpSession};

const STARTED: &str =
    "Network monitoring started. Use 'get_requests' to retrieve captured requests or 'stop' to end monitoring.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub request_id: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub timestamp: Value,
    #[serde(default)]
    pub post_data: String,
}

impl CapturedRequest {
    fn from_event(params: &Value) -> Self {
        let request = &params["request"];
        let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
        Self {
            request_id: text(&params["requestId"]),
            url: text(&request["url"]),
            method: text(&request["method"]),
            headers: request.get("headers").cloned().unwrap_or_else(|| json!({})),
            timestamp: params.get("timestamp").cloned().unwrap_or(Value::Null),
            post_data: text(&request["postData"]),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Filters {
    url: Option<String>,
    method: Option<String>,
}

impl Filters {
    fn accepts(&self, request: &CapturedRequest) -> bool {
        let url_ok = self
            .url
            .as_deref()
            .is_none_or(|f| request.url.to_lowercase().contains(&f.to_lowercase()));
        let method_ok = self
            .method
            .as_deref()
            .is_none_or(|m| request.method.eq_ignore_ascii_case(m));
        url_ok && method_ok
    }
}

#[derive(Default)]
struct Monitor {
    requests: Vec<CapturedRequest>,
    filters: Filters,
    task: Option<JoinHandle<()>>,
}

impl Monitor {
    fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Walk a dotted key path. Digit segments index arrays; a name applied to
/// an array reads it from the array's first element. Missing keys yield null.
fn extract_path(body: &Value, path: &str) -> Value {
    let mut current = body;
    for key in path.split('.') {
        let next = match current {
            Value::Array(items) => match key.parse::<usize>() {
                Ok(index) => items.get(index),
                Err(_) => items.first().and_then(|first| first.get(key)),
            },
            Value::Object(map) => map.get(key),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn filter_body(post_data: &str, filter_keys: &[String]) -> Result<serde_json::Map<String, Value>, String> {
    let body: Value = serde_json::from_str(post_data).map_err(|e| e.to_string())?;
    Ok(filter_keys
        .iter()
        .map(|key| (key.clone(), extract_path(&body, key)))
        .collect())
}

fn pretty(value: &impl Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

pub struct InspectNetworkTool {
    cdp_url: String,
    http: reqwest::Client,
    monitor: Arc<Mutex<Monitor>>,
    capture_wait: Duration,
}

impl InspectNetworkTool {
    pub fn new(cdp_url: impl Into<String>) -> Self {
        Self {
            cdp_url: cdp_url.into(),
            http: reqwest::Client::new(),
            monitor: Arc::new(Mutex::new(Monitor::default())),
            capture_wait: Duration::from_secs(2),
        }
    }

    /// How long `capture` lets in-flight requests arrive before reading.
    pub fn with_capture_wait(mut self, wait: Duration) -> Self {
        self.capture_wait = wait;
        self
    }

    fn monitor(&self) -> MutexGuard<'_, Monitor> {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor().is_active()
    }

    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.monitor().requests.clone()
    }

    async fn start_monitoring(&self, filters: Filters) -> Result<String, String> {
        if self.is_monitoring() {
            self.monitor().filters = filters;
            return Ok(STARTED.to_string());
        }

        let mut session = cdp::connect_first_page(&self.http, &self.cdp_url)
            .await
            .map_err(|e| e.to_string())?;
        session
            .call("Network.enable", json!({}))
            .await
            .map_err(|e| format!("Failed to start network monitoring: {e}"))?;

        let shared = Arc::clone(&self.monitor);
        let task = tokio::spawn(capture_events(session, shared));
        let mut monitor = self.monitor();
        monitor.filters = filters;
        monitor.task = Some(task);
        info!(cdp_url = %self.cdp_url, "Network monitoring started");
        Ok(STARTED.to_string())
    }

    fn stop_monitoring(&self) -> String {
        if let Some(task) = self.monitor().task.take() {
            task.abort();
            debug!("Network monitoring task aborted");
        }
        "Network monitoring stopped".to_string()
    }

    fn list_requests(&self, filter_keys: &[String]) -> String {
        let requests = self.captured();
        let mut output = format!("Retrieved {} captured requests", requests.len());
        if requests.is_empty() {
            return output;
        }
        output.push_str("\n\nCaptured Requests:\n");
        for (i, request) in requests.iter().enumerate() {
            output.push_str(&format!("{}. [{}] {}\n", i + 1, request.method, request.url));
            if request.post_data.is_empty() {
                continue;
            }
            if filter_keys.is_empty() {
                output.push_str(&format!("   Full Body: {}\n", request.post_data));
                continue;
            }
            match filter_body(&request.post_data, filter_keys) {
                Ok(filtered) => output.push_str(&format!("   Filtered Data: {}\n", pretty(&filtered))),
                Err(e) => output.push_str(&format!("   Error filtering data: {e}\n")),
            }
        }
        output
    }

    async fn capture(&self, url_filter: Option<&str>, filter_keys: &[String]) -> Result<String, String> {
        if !self.is_monitoring() {
            self.start_monitoring(Filters::default()).await?;
        }
        tokio::time::sleep(self.capture_wait).await;

        let needle = url_filter.map(str::to_lowercase);
        let matching: Vec<CapturedRequest> = self
            .captured()
            .into_iter()
            .filter(|r| needle.as_deref().is_none_or(|n| r.url.to_lowercase().contains(n)))
            .collect();
        let Some(latest) = matching.last() else {
            return Err(format!(
                "No network requests found matching filter: {}",
                url_filter.unwrap_or("any")
            ));
        };

        let mut output = format!(
            "Found {} matching requests. Showing the most recent:\n\n[{}] {}\n",
            matching.len(),
            latest.method,
            latest.url
        );
        let mut frontend_request = json!({
            "url": latest.url,
            "method": latest.method,
            "timestamp": latest.timestamp,
        });

        if !latest.post_data.is_empty() {
            if filter_keys.is_empty() {
                output.push_str(&format!("\nRequest Body:\n{}\n", latest.post_data));
                frontend_request["body"] = serde_json::from_str(&latest.post_data)
                    .unwrap_or_else(|_| Value::String(latest.post_data.clone()));
            } else {
                match filter_body(&latest.post_data, filter_keys) {
                    Ok(filtered) => {
                        output.push_str(&format!("\nFiltered Data:\n{}\n", pretty(&filtered)));
                        frontend_request["filtered_data"] = Value::Object(filtered);
                    }
                    Err(e) => output.push_str(&format!("\nError filtering data: {e}\n")),
                }
            }
        }

        let inspector = json!({
            "requests": [frontend_request],
            "operation": "capture",
            "timestamp": Utc::now().to_rfc3339(),
            "url_filter": url_filter,
            "filter_keys": filter_keys,
            "total_matching": matching.len(),
        });
        output.push_str(&format!("\n<inspector>\n{}\n</inspector>", pretty(&inspector)));
        Ok(output)
    }
}

impl Drop for InspectNetworkTool {
    fn drop(&mut self) {
        if let Some(task) = self.monitor().task.take() {
            task.abort();
        }
    }
}

async fn capture_events(mut session: CdpSession, monitor: Arc<Mutex<Monitor>>) {
    loop {
        let event = match session.next_event().await {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Network monitoring ended");
                return;
            }
        };
        if event["method"] != "Network.requestWillBeSent" {
            continue;
        }
        let request = CapturedRequest::from_event(&event["params"]);
        let mut monitor = monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.filters.accepts(&request) {
            monitor.requests.push(request);
        }
    }
}

#[async_trait]
impl Tool for InspectNetworkTool {
    fn name(&self) -> &str {
        "inspect_network"
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::custom(
            "inspect_network",
            "Monitor and inspect network requests in the Chromium browser. By default captures the most recent request matching url_filter and extracts filter_keys from its JSON body.",
            self.input_schema(),
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["capture", "start", "monitor_start", "stop", "get_requests", "clear"],
                    "description": "capture (default): latest matching request; start: monitor for a duration; monitor_start: begin background monitoring; stop; get_requests; clear"
                },
                "duration": {
                    "type": "number",
                    "description": "For 'start': seconds to monitor (default: 30)",
                    "default": 30
                },
                "url_filter": {
                    "type": "string",
                    "description": "Case-insensitive substring the request URL must contain"
                },
                "method_filter": {
                    "type": "string",
                    "description": "HTTP method to keep while monitoring (GET, POST, ...)"
                },
                "filter_keys": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Dotted key paths to extract from the JSON request body (e.g. ['events.0.xdm.eventType'])"
                }
            }
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult, ToolError> {
        let action = input["action"].as_str().unwrap_or("capture");
        let url_filter = input["url_filter"].as_str().filter(|f| !f.is_empty());
        let filter_keys: Vec<String> = input["filter_keys"]
            .as_array()
            .map(|keys| keys.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let filters = Filters {
            url: url_filter.map(str::to_string),
            method: input["method_filter"].as_str().map(str::to_string),
        };

        let outcome = match action {
            "capture" => self.capture(url_filter, &filter_keys).await,
            "monitor_start" => self.start_monitoring(filters).await,
            "start" => {
                let duration = input["duration"].as_f64().filter(|d| *d >= 0.0).unwrap_or(30.0);
                match self.start_monitoring(filters).await {
                    Ok(_) => {
                        tokio::time::sleep(Duration::from_secs_f64(duration)).await;
                        let listing = self.list_requests(&filter_keys);
                        self.stop_monitoring();
                        Ok(listing)
                    }
                    Err(e) => Err(e),
                }
            }
            "get_requests" => Ok(self.list_requests(&filter_keys)),
            "clear" => {
                let mut monitor = self.monitor();
                let count = monitor.requests.len();
                monitor.requests.clear();
                Ok(format!("Cleared {count} captured requests"))
            }
            "stop" => Ok(self.stop_monitoring()),
            other => Err(format!("Unknown action: {other}")),
        };

        Ok(match outcome {
            Ok(output) => ToolResult::output(output),
            Err(error) => ToolResult::error(error),
        })
    }
}
