//! Computer tool: drive the X display with `xdotool` and capture it with `scrot`.
//!
//! Each action is first turned into a [`Plan`] (validated arguments and the
//! exact commands to run), then executed. Most actions end with a
//! screenshot so the model sees the effect of what it did.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, Weak};
use std::time::Duration;
use tilt_config::ComputerConfig;
use tilt_core::error::ToolError;
use tilt_core::provider::ToolDefinition;
use tilt_core::tool::{Tool, ToolCollection, ToolResult};
use tokio::process::Command;
use tracing::{debug, info, warn};

const TYPING_DELAY_MS: u32 = 12;
const TYPING_GROUP_SIZE: usize = 50;
const SCREENSHOT_DELAY: Duration = Duration::from_secs(2);

/// Which action set the tool exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputerVersion {
    V20241022,
    V20250124,
}

impl ComputerVersion {
    pub fn api_type(&self) -> &'static str {
        match self {
            Self::V20241022 => "computer_20241022",
            Self::V20250124 => "computer_20250124",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleSource {
    /// Coordinates chosen by the model, in the scaled space.
    Api,
    /// Coordinates reported by the display.
    Computer,
}

/// Resolutions screenshots are scaled down to when the display's aspect ratio matches.
const SCALING_TARGETS: [(&str, u32, u32); 3] = [("XGA", 1024, 768), ("WXGA", 1280, 800), ("FWXGA", 1366, 768)];

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Xdotool(Vec<String>),
    Sleep(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Screenshot { delay: bool },
    CursorPosition,
}

#[derive(Debug, Clone, PartialEq)]
struct Plan {
    steps: Vec<Step>,
    finish: Finish,
    is_click: bool,
}

impl Plan {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            finish: Finish::Screenshot { delay: true },
            is_click: false,
        }
    }
}

fn xdo<I, S>(args: I) -> Step
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Step::Xdotool(args.into_iter().map(Into::into).collect())
}

pub struct ComputerTool {
    version: ComputerVersion,
    display: String,
    width: u32,
    height: u32,
    screenshot_dir: PathBuf,
    scaling_enabled: bool,
    screenshot_delay: Duration,
    collection: OnceLock<Weak<ToolCollection>>,
    network_started: AtomicBool,
}

impl ComputerTool {
    pub fn new(version: ComputerVersion, config: &ComputerConfig) -> Self {
        Self {
            version,
            display: config.display.clone(),
            width: config.width,
            height: config.height,
            screenshot_dir: config.screenshot_dir.clone(),
            scaling_enabled: true,
            screenshot_delay: SCREENSHOT_DELAY,
            collection: OnceLock::new(),
            network_started: AtomicBool::new(false),
        }
    }

    pub fn with_screenshot_delay(mut self, delay: Duration) -> Self {
        self.screenshot_delay = delay;
        self
    }

    /// `":1"` or `":1.0"` gives display number 1.
    fn display_number(&self) -> Option<u32> {
        let rest = self.display.rsplit(':').next()?;
        rest.split('.').next()?.parse().ok()
    }

    fn scaling_target(&self) -> Option<(u32, u32)> {
        if !self.scaling_enabled || self.height == 0 {
            return None;
        }
        let ratio = self.width as f64 / self.height as f64;
        SCALING_TARGETS
            .iter()
            .find(|(_, w, h)| (*w as f64 / *h as f64 - ratio).abs() < 0.02 && *w < self.width)
            .map(|(_, w, h)| (*w, *h))
    }

    /// The display size the model is told about.
    fn api_dimensions(&self) -> (u32, u32) {
        self.scaling_target().unwrap_or((self.width, self.height))
    }

    fn scale_coordinates(&self, source: ScaleSource, x: i64, y: i64) -> Result<(i64, i64), String> {
        let Some((target_w, target_h)) = self.scaling_target() else {
            return Ok((x, y));
        };
        let x_factor = target_w as f64 / self.width as f64;
        let y_factor = target_h as f64 / self.height as f64;
        match source {
            ScaleSource::Api => {
                if x > target_w as i64 || y > target_h as i64 {
                    return Err(format!("Coordinates {x}, {y} are out of bounds"));
                }
                Ok(((x as f64 / x_factor).round() as i64, (y as f64 / y_factor).round() as i64))
            }
            ScaleSource::Computer => Ok(((x as f64 * x_factor).round() as i64, (y as f64 * y_factor).round() as i64)),
        }
    }

    fn coordinate(&self, value: &Value) -> Result<(i64, i64), String> {
        let pair = value
            .as_array()
            .filter(|a| a.len() == 2)
            .and_then(|a| Some((a[0].as_i64()?, a[1].as_i64()?)))
            .filter(|(x, y)| *x >= 0 && *y >= 0);
        let (x, y) = pair.ok_or_else(|| format!("{value} must be a tuple of non-negative ints"))?;
        self.scale_coordinates(ScaleSource::Api, x, y)
    }

    fn plan(&self, input: &Value) -> Result<Plan, String> {
        let action = input["action"].as_str().unwrap_or_default();
        let text = input["text"].as_str();
        let coordinate = input.get("coordinate").filter(|c| !c.is_null());
        let extended = self.version == ComputerVersion::V20250124;

        let forbid_text = || match text {
            Some(_) => Err(format!("text is not accepted for {action}")),
            None => Ok(()),
        };
        let forbid_coordinate = || match coordinate {
            Some(_) => Err(format!("coordinate is not accepted for {action}")),
            None => Ok(()),
        };
        let require_text = || text.ok_or_else(|| format!("text is required for {action}"));
        let require_coordinate = || {
            coordinate
                .ok_or_else(|| format!("coordinate is required for {action}"))
                .and_then(|c| self.coordinate(c))
        };

        match action {
            "key" => {
                forbid_coordinate()?;
                Ok(Plan::new(vec![xdo(["key", "--", require_text()?])]))
            }
            "type" => {
                forbid_coordinate()?;
                let text: Vec<char> = require_text()?.chars().collect();
                let steps = text
                    .chunks(TYPING_GROUP_SIZE)
                    .map(|chunk| {
                        let delay = TYPING_DELAY_MS.to_string();
                        xdo(["type".to_string(), "--delay".into(), delay, "--".into(), chunk.iter().collect()])
                    })
                    .collect();
                Ok(Plan::new(steps))
            }
            "mouse_move" => {
                forbid_text()?;
                let (x, y) = require_coordinate()?;
                Ok(Plan::new(vec![mousemove(x, y)]))
            }
            "left_click_drag" => {
                forbid_text()?;
                let (x, y) = require_coordinate()?;
                Ok(Plan::new(vec![xdo([
                    "mousedown".to_string(),
                    "1".into(),
                    "mousemove".into(),
                    "--sync".into(),
                    x.to_string(),
                    y.to_string(),
                    "mouseup".into(),
                    "1".into(),
                ])]))
            }
            "left_click" | "right_click" | "middle_click" | "double_click" => self.plan_click(action, text, coordinate),
            "triple_click" if extended => self.plan_click(action, text, coordinate),
            "screenshot" => {
                forbid_text()?;
                forbid_coordinate()?;
                Ok(Plan {
                    steps: vec![],
                    finish: Finish::Screenshot { delay: false },
                    is_click: false,
                })
            }
            "cursor_position" => {
                forbid_text()?;
                forbid_coordinate()?;
                Ok(Plan {
                    steps: vec![],
                    finish: Finish::CursorPosition,
                    is_click: false,
                })
            }
            "left_mouse_down" | "left_mouse_up" if extended => {
                forbid_coordinate()?;
                let verb = if action == "left_mouse_down" { "mousedown" } else { "mouseup" };
                Ok(Plan::new(vec![xdo([verb, "1"])]))
            }
            "scroll" if extended => {
                let direction = input["scroll_direction"].as_str().unwrap_or_default();
                let button = match direction {
                    "up" => "4",
                    "down" => "5",
                    "left" => "6",
                    "right" => "7",
                    other => return Err(format!("{other} must be 'up', 'down', 'left', or 'right'")),
                };
                let amount = input["scroll_amount"]
                    .as_i64()
                    .filter(|a| *a >= 0)
                    .ok_or_else(|| format!("{} must be a non-negative int", input["scroll_amount"]))?;
                let mut steps = Vec::new();
                if coordinate.is_some() {
                    let (x, y) = require_coordinate()?;
                    steps.push(mousemove(x, y));
                }
                let click = xdo(["click".to_string(), "--repeat".into(), amount.to_string(), button.into()]);
                steps.extend(with_modifier(text, click));
                Ok(Plan::new(steps))
            }
            "hold_key" if extended => {
                let key = require_text()?;
                let duration = self.duration(input)?;
                Ok(Plan::new(vec![
                    xdo(["keydown", key]),
                    Step::Sleep(duration),
                    xdo(["keyup", key]),
                ]))
            }
            "wait" if extended => {
                let duration = self.duration(input)?;
                Ok(Plan {
                    steps: vec![Step::Sleep(duration)],
                    finish: Finish::Screenshot { delay: false },
                    is_click: false,
                })
            }
            other => Err(format!("Invalid action: {other}")),
        }
    }

    fn plan_click(&self, action: &str, text: Option<&str>, coordinate: Option<&Value>) -> Result<Plan, String> {
        let mut steps = Vec::new();
        match self.version {
            ComputerVersion::V20241022 => {
                if text.is_some() {
                    return Err(format!("text is not accepted for {action}"));
                }
                if coordinate.is_some() {
                    return Err(format!("coordinate is not accepted for {action}"));
                }
            }
            ComputerVersion::V20250124 => {
                if let Some(coordinate) = coordinate {
                    let (x, y) = self.coordinate(coordinate)?;
                    steps.push(mousemove(x, y));
                }
            }
        }
        let click: Vec<&str> = match action {
            "left_click" => vec!["click", "1"],
            "right_click" => vec!["click", "3"],
            "middle_click" => vec!["click", "2"],
            "double_click" => vec!["click", "--repeat", "2", "--delay", "500", "1"],
            _ => vec!["click", "--repeat", "3", "1"],
        };
        let modifier = if self.version == ComputerVersion::V20250124 { text } else { None };
        steps.extend(with_modifier(modifier, xdo(click)));
        Ok(Plan {
            steps,
            finish: Finish::Screenshot { delay: true },
            is_click: true,
        })
    }

    fn duration(&self, input: &Value) -> Result<Duration, String> {
        input["duration"]
            .as_f64()
            .filter(|d| (0.0..=100.0).contains(d))
            .map(Duration::from_secs_f64)
            .ok_or_else(|| format!("duration={} must be a number between 0 and 100", input["duration"]))
    }

    async fn xdotool(&self, args: &[String]) -> Result<(String, String), ToolError> {
        debug!(args = ?args, "xdotool");
        let output = Command::new("xdotool")
            .args(args)
            .env("DISPLAY", &self.display)
            .output()
            .await
            .map_err(|e| ToolError::Unavailable(format!("xdotool: {e}")))?;
        Ok((
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }

    /// Capture the display and return it base64-encoded.
    async fn screenshot(&self) -> Result<String, ToolError> {
        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "computer".into(),
            reason: format!("Failed to take screenshot: {reason}"),
        };
        tokio::fs::create_dir_all(&self.screenshot_dir)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let path = self
            .screenshot_dir
            .join(format!("screenshot_{}.png", uuid::Uuid::new_v4().simple()));

        let capture = Command::new("scrot")
            .arg("-p")
            .arg(&path)
            .env("DISPLAY", &self.display)
            .output()
            .await
            .map_err(|e| ToolError::Unavailable(format!("scrot: {e}")))?;
        if !capture.status.success() {
            return Err(failed(String::from_utf8_lossy(&capture.stderr).trim().to_string()));
        }

        if let Some((w, h)) = self.scaling_target() {
            let resize = Command::new("convert")
                .arg(&path)
                .args(["-resize", &format!("{w}x{h}!")])
                .arg(&path)
                .output()
                .await;
            if let Err(e) = resize {
                warn!(error = %e, "Screenshot resize failed; sending full size");
            }
        }

        let bytes = tokio::fs::read(&path).await.map_err(|e| failed(e.to_string()))?;
        let _ = tokio::fs::remove_file(&path).await;
        Ok(STANDARD.encode(bytes))
    }

    async fn cursor_position(&self) -> Result<ToolResult, ToolError> {
        let (stdout, stderr) = self.xdotool(&["getmouselocation".into(), "--shell".into()]).await?;
        if !stderr.is_empty() {
            return Ok(ToolResult::error(stderr));
        }
        let Some((x, y)) = parse_mouse_location(&stdout) else {
            return Ok(ToolResult::error(format!("Unexpected cursor output: {stdout}")));
        };
        match self.scale_coordinates(ScaleSource::Computer, x, y) {
            Ok((x, y)) => Ok(ToolResult::output(format!("X={x},Y={y}"))),
            Err(e) => Ok(ToolResult::error(e)),
        }
    }

    /// Start network capture the first time the model clicks, so requests
    /// fired by the page it just opened are recorded.
    async fn start_network_capture_once(&self) {
        if self.network_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(collection) = self.collection.get().and_then(Weak::upgrade) else {
            return;
        };
        if !collection.contains("inspect_network") {
            return;
        }
        match collection
            .run("inspect_network", json!({"action": "monitor_start"}))
            .await
        {
            Ok(result) if !result.is_error() => info!("Network capture started after first click"),
            Ok(result) => debug!(error = ?result.error, "Network capture not started"),
            Err(e) => warn!(error = %e, "Network capture failed"),
        }
    }
}

fn mousemove(x: i64, y: i64) -> Step {
    xdo(["mousemove".to_string(), "--sync".into(), x.to_string(), y.to_string()])
}

/// Wrap `step` in keydown/keyup of `modifier` when one is given.
fn with_modifier(modifier: Option<&str>, step: Step) -> Vec<Step> {
    match modifier {
        Some(key) => vec![xdo(["keydown", key]), step, xdo(["keyup", key])],
        None => vec![step],
    }
}

/// Parse `xdotool getmouselocation --shell` output (`X=..` / `Y=..` lines).
fn parse_mouse_location(output: &str) -> Option<(i64, i64)> {
    let field = |name: &str| {
        output
            .lines()
            .find_map(|line| line.trim().strip_prefix(name))
            .and_then(|v| v.parse().ok())
    };
    Some((field("X=")?, field("Y=")?))
}

#[async_trait]
impl Tool for ComputerTool {
    fn name(&self) -> &str {
        "computer"
    }

    fn to_definition(&self) -> ToolDefinition {
        let (width, height) = self.api_dimensions();
        let definition = ToolDefinition::builtin(self.version.api_type(), "computer")
            .with_option("display_width_px", json!(width))
            .with_option("display_height_px", json!(height));
        match self.display_number() {
            Some(n) => definition.with_option("display_number", json!(n)),
            None => definition,
        }
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string"},
                "text": {"type": "string"},
                "coordinate": {"type": "array"},
                "scroll_direction": {"type": "string"},
                "scroll_amount": {"type": "integer"},
                "duration": {"type": "number"}
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult, ToolError> {
        let plan = match self.plan(&input) {
            Ok(plan) => plan,
            Err(message) => return Ok(ToolResult::error(message)),
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        for step in &plan.steps {
            match step {
                Step::Xdotool(args) => {
                    let (out, err) = self.xdotool(args).await?;
                    stdout.push(out);
                    stderr.push(err);
                }
                Step::Sleep(duration) => tokio::time::sleep(*duration).await,
            }
        }
        if plan.is_click {
            self.start_network_capture_once().await;
        }

        let join = |parts: Vec<String>| {
            let joined = parts.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join("\n");
            (!joined.is_empty()).then_some(joined)
        };
        let mut result = ToolResult {
            output: join(stdout),
            error: join(stderr),
            ..ToolResult::default()
        };

        match plan.finish {
            Finish::CursorPosition => return self.cursor_position().await,
            Finish::Screenshot { delay } => {
                if delay {
                    tokio::time::sleep(self.screenshot_delay).await;
                }
                result.base64_image = Some(self.screenshot().await?);
            }
        }
        Ok(result)
    }

    fn attach_collection(&self, collection: Weak<ToolCollection>) {
        let _ = self.collection.set(collection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(width: u32, height: u32) -> ComputerConfig {
        ComputerConfig {
            display: ":1".into(),
            width,
            height,
            screenshot_dir: std::env::temp_dir(),
        }
    }

    fn tool(version: ComputerVersion) -> ComputerTool {
        ComputerTool::new(version, &config(1024, 768))
    }

    fn args(step: &Step) -> Vec<&str> {
        match step {
            Step::Xdotool(args) => args.iter().map(String::as_str).collect(),
            Step::Sleep(_) => vec!["<sleep>"],
        }
    }

    #[test]
    fn definition_carries_display_options() {
        let def = serde_json::to_value(tool(ComputerVersion::V20250124).to_definition()).unwrap();
        assert_eq!(
            def,
            json!({
                "type": "computer_20250124",
                "name": "computer",
                "display_width_px": 1024,
                "display_height_px": 768,
                "display_number": 1
            })
        );
    }

    #[test]
    fn large_displays_are_scaled_to_matching_target() {
        let tool = ComputerTool::new(ComputerVersion::V20241022, &config(2560, 1600));
        assert_eq!(tool.api_dimensions(), (1280, 800));
        assert_eq!(tool.scale_coordinates(ScaleSource::Api, 640, 400).unwrap(), (1280, 800));
        assert_eq!(tool.scale_coordinates(ScaleSource::Computer, 1280, 800).unwrap(), (640, 400));
        assert!(tool.scale_coordinates(ScaleSource::Api, 1300, 10).is_err());
    }

    #[test]
    fn native_xga_is_not_scaled() {
        let tool = tool(ComputerVersion::V20241022);
        assert_eq!(tool.scale_coordinates(ScaleSource::Api, 5000, 10).unwrap(), (5000, 10));
    }

    #[test]
    fn typing_is_chunked() {
        let text = "a".repeat(120);
        let plan = tool(ComputerVersion::V20241022)
            .plan(&json!({"action": "type", "text": text}))
            .unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(&args(&plan.steps[0])[..4], &["type", "--delay", "12", "--"]);
        assert_eq!(args(&plan.steps[2])[4].len(), 20);
    }

    #[test]
    fn key_and_drag_commands() {
        let tool = tool(ComputerVersion::V20241022);
        let key = tool.plan(&json!({"action": "key", "text": "ctrl+l"})).unwrap();
        assert_eq!(args(&key.steps[0]), ["key", "--", "ctrl+l"]);

        let drag = tool
            .plan(&json!({"action": "left_click_drag", "coordinate": [10, 20]}))
            .unwrap();
        assert_eq!(
            args(&drag.steps[0]),
            ["mousedown", "1", "mousemove", "--sync", "10", "20", "mouseup", "1"]
        );
    }

    #[test]
    fn argument_validation() {
        let tool = tool(ComputerVersion::V20241022);
        let err = |input: Value| tool.plan(&input).unwrap_err();
        assert_eq!(err(json!({"action": "key"})), "text is required for key");
        assert_eq!(err(json!({"action": "mouse_move"})), "coordinate is required for mouse_move");
        assert_eq!(
            err(json!({"action": "mouse_move", "coordinate": [-1, 2]})),
            "[-1,2] must be a tuple of non-negative ints"
        );
        assert_eq!(
            err(json!({"action": "left_click", "coordinate": [1, 2]})),
            "coordinate is not accepted for left_click"
        );
        assert_eq!(err(json!({"action": "scroll"})), "Invalid action: scroll");
    }

    #[test]
    fn extended_clicks_move_first_and_hold_modifiers() {
        let tool = tool(ComputerVersion::V20250124);
        let plan = tool
            .plan(&json!({"action": "double_click", "coordinate": [5, 6], "text": "shift"}))
            .unwrap();
        assert!(plan.is_click);
        let steps: Vec<Vec<&str>> = plan.steps.iter().map(args).collect();
        assert_eq!(
            steps,
            vec![
                vec!["mousemove", "--sync", "5", "6"],
                vec!["keydown", "shift"],
                vec!["click", "--repeat", "2", "--delay", "500", "1"],
                vec!["keyup", "shift"],
            ]
        );
    }

    #[test]
    fn scroll_maps_direction_to_button() {
        let tool = tool(ComputerVersion::V20250124);
        let plan = tool
            .plan(&json!({"action": "scroll", "scroll_direction": "down", "scroll_amount": 3}))
            .unwrap();
        assert_eq!(args(&plan.steps[0]), ["click", "--repeat", "3", "5"]);

        let bad = tool
            .plan(&json!({"action": "scroll", "scroll_direction": "sideways", "scroll_amount": 1}))
            .unwrap_err();
        assert!(bad.contains("must be 'up', 'down', 'left', or 'right'"));
    }

    #[test]
    fn wait_and_hold_key_sleep() {
        let tool = tool(ComputerVersion::V20250124);
        let wait = tool.plan(&json!({"action": "wait", "duration": 0.5})).unwrap();
        assert_eq!(wait.steps, vec![Step::Sleep(Duration::from_millis(500))]);
        assert_eq!(wait.finish, Finish::Screenshot { delay: false });

        let hold = tool.plan(&json!({"action": "hold_key", "text": "a", "duration": 1})).unwrap();
        assert_eq!(hold.steps.len(), 3);
        assert!(tool.plan(&json!({"action": "wait", "duration": 500})).is_err());
    }

    #[test]
    fn cursor_position_parsing() {
        assert_eq!(parse_mouse_location("X=120\nY=44\nSCREEN=0\nWINDOW=123"), Some((120, 44)));
        assert_eq!(parse_mouse_location("garbage"), None);
    }

    #[tokio::test]
    async fn invalid_action_is_an_error_result() {
        let result = tool(ComputerVersion::V20241022)
            .execute(json!({"action": "fly"}))
            .await
            .unwrap();
        assert_eq!(result.error.as_deref(), Some("Invalid action: fly"));
    }
}
