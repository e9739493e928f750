//! File viewing and editing tool (`str_replace_editor` family).
//!
//! Commands: `view`, `create`, `str_replace`, `insert` and, except in the
//! 20250429 version, `undo_edit`. Every mutation records the previous file
//! text so it can be undone. Problems with the request come back as error
//! results the model can read and correct.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tilt_core::error::ToolError;
use tilt_core::provider::ToolDefinition;
use tilt_core::tool::{Tool, ToolResult};
use tokio::process::Command;
use tracing::debug;

const SNIPPET_LINES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditVersion {
    V20241022,
    V20250124,
    V20250429,
}

impl EditVersion {
    pub fn api_type(&self) -> &'static str {
        match self {
            Self::V20241022 => "text_editor_20241022",
            Self::V20250124 => "text_editor_20250124",
            Self::V20250429 => "text_editor_20250429",
        }
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::V20250429 => "str_replace_based_edit_tool",
            _ => "str_replace_editor",
        }
    }

    fn commands(&self) -> &'static [&'static str] {
        match self {
            Self::V20250429 => &["view", "create", "str_replace", "insert"],
            _ => &["view", "create", "str_replace", "insert", "undo_edit"],
        }
    }
}

/// Replace tabs with spaces up to the next multiple of 8 columns.
fn expand_tabs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut column = 0;
    for ch in text.chars() {
        match ch {
            '\t' => {
                let pad = 8 - column % 8;
                out.extend(std::iter::repeat_n(' ', pad));
                column += pad;
            }
            '\n' | '\r' => {
                out.push(ch);
                column = 0;
            }
            _ => {
                out.push(ch);
                column += 1;
            }
        }
    }
    out
}

/// `cat -n` style listing of `content` starting at line `first_line`.
fn numbered(content: &str, descriptor: &str, first_line: usize) -> String {
    let content = expand_tabs(content);
    let lines: Vec<String> = content
        .split('\n')
        .enumerate()
        .map(|(i, line)| format!("{:6}\t{line}", i + first_line))
        .collect();
    format!(
        "Here's the result of running `cat -n` on {descriptor}:\n{}\n",
        lines.join("\n")
    )
}

pub struct EditTool {
    version: EditVersion,
    history: Mutex<HashMap<PathBuf, Vec<String>>>,
}

type Outcome = Result<String, String>;

impl EditTool {
    pub fn new(version: EditVersion) -> Self {
        Self {
            version,
            history: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, path: &Path, previous: String) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(path.to_path_buf())
            .or_default()
            .push(previous);
    }

    fn validate_path(&self, command: &str, path: &Path) -> Result<(), String> {
        let shown = path.display();
        if !path.is_absolute() {
            return Err(format!(
                "The path {shown} is not an absolute path, it should start with `/`. Maybe you meant {}?",
                Path::new("/").join(path).display()
            ));
        }
        let exists = path.exists();
        if !exists && command != "create" {
            return Err(format!("The path {shown} does not exist. Please provide a valid path."));
        }
        if exists && command == "create" {
            return Err(format!(
                "File already exists at: {shown}. Cannot overwrite files using command `create`."
            ));
        }
        if path.is_dir() && command != "view" {
            return Err(format!(
                "The path {shown} is a directory and only the `view` command can be used on directories"
            ));
        }
        Ok(())
    }

    async fn read(path: &Path) -> Result<String, String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Ran into {e} while trying to read {}", path.display()))
    }

    async fn write(path: &Path, text: &str) -> Result<(), String> {
        tokio::fs::write(path, text)
            .await
            .map_err(|e| format!("Ran into {e} while trying to write to {}", path.display()))
    }

    async fn view(&self, path: &Path, view_range: Option<&Value>) -> Outcome {
        if path.is_dir() {
            if view_range.is_some() {
                return Err("The `view_range` parameter is not allowed when `path` points to a directory.".into());
            }
            let listing = Command::new("find")
                .arg(path)
                .args(["-maxdepth", "2", "-not", "-path", "*/.*"])
                .output()
                .await
                .map_err(|e| format!("Ran into {e} while listing {}", path.display()))?;
            let stderr = String::from_utf8_lossy(&listing.stderr).trim().to_string();
            if !stderr.is_empty() {
                return Err(stderr);
            }
            return Ok(format!(
                "Here's the files and directories up to 2 levels deep in {}, excluding hidden items:\n{}\n",
                path.display(),
                String::from_utf8_lossy(&listing.stdout).trim_end()
            ));
        }

        let content = Self::read(path).await?;
        let Some(range) = view_range else {
            return Ok(numbered(&content, &path.display().to_string(), 1));
        };

        let bounds = range
            .as_array()
            .filter(|r| r.len() == 2)
            .and_then(|r| Some((r[0].as_i64()?, r[1].as_i64()?)));
        let Some((first, last)) = bounds else {
            return Err("Invalid `view_range`. It should be a list of two integers.".into());
        };
        let lines: Vec<&str> = content.split('\n').collect();
        let n = lines.len() as i64;
        if first < 1 || first > n {
            return Err(format!(
                "Invalid `view_range`: {range}. Its first element `{first}` should be within the range of lines of the file: [1, {n}]"
            ));
        }
        if last > n {
            return Err(format!(
                "Invalid `view_range`: {range}. Its second element `{last}` should be smaller than the number of lines in the file: `{n}`"
            ));
        }
        if last != -1 && last < first {
            return Err(format!(
                "Invalid `view_range`: {range}. Its second element `{last}` should be larger or equal than its first `{first}`"
            ));
        }
        let end = if last == -1 { lines.len() } else { last as usize };
        let slice = lines[(first - 1) as usize..end].join("\n");
        Ok(numbered(&slice, &path.display().to_string(), first as usize))
    }

    async fn create(&self, path: &Path, file_text: Option<&str>) -> Outcome {
        let text = file_text.ok_or("Parameter `file_text` is required for command: create")?;
        Self::write(path, text).await?;
        self.remember(path, text.to_string());
        Ok(format!("File created successfully at: {}", path.display()))
    }

    async fn str_replace(&self, path: &Path, old_str: Option<&str>, new_str: Option<&str>) -> Outcome {
        let old_str = old_str.ok_or("Parameter `old_str` is required for command: str_replace")?;
        let original = Self::read(path).await?;
        let content = expand_tabs(&original);
        let old = expand_tabs(old_str);
        let new = expand_tabs(new_str.unwrap_or_default());

        let occurrences = content.matches(old.as_str()).count();
        if old.is_empty() || occurrences == 0 {
            return Err(format!(
                "No replacement was performed, old_str `{old_str}` did not appear verbatim in {}.",
                path.display()
            ));
        }
        if occurrences > 1 {
            let lines: Vec<String> = content
                .split('\n')
                .enumerate()
                .filter(|(_, line)| line.contains(old.as_str()))
                .map(|(i, _)| (i + 1).to_string())
                .collect();
            return Err(format!(
                "No replacement was performed. Multiple occurrences of old_str `{old_str}` in lines [{}]. Please ensure it is unique",
                lines.join(", ")
            ));
        }

        let updated = content.replacen(old.as_str(), &new, 1);
        Self::write(path, &updated).await?;
        self.remember(path, original);

        let at = content.find(old.as_str()).unwrap_or(0);
        let replacement_line = content[..at].matches('\n').count();
        let start = replacement_line.saturating_sub(SNIPPET_LINES);
        let end = replacement_line + SNIPPET_LINES + new.matches('\n').count();
        let snippet: Vec<&str> = updated.split('\n').skip(start).take(end + 1 - start).collect();

        Ok(format!(
            "The file {} has been edited. {}Review the changes and make sure they are as expected. Edit the file again if necessary.",
            path.display(),
            numbered(&snippet.join("\n"), &format!("a snippet of {}", path.display()), start + 1)
        ))
    }

    async fn insert(&self, path: &Path, insert_line: Option<i64>, new_str: Option<&str>) -> Outcome {
        let insert_line = insert_line.ok_or("Parameter `insert_line` is required for command: insert")?;
        let new_str = new_str.ok_or("Parameter `new_str` is required for command: insert")?;
        let original = Self::read(path).await?;
        let content = expand_tabs(&original);
        let lines: Vec<&str> = content.split('\n').collect();
        let n = lines.len();
        if insert_line < 0 || insert_line as usize > n {
            return Err(format!(
                "Invalid `insert_line` parameter: {insert_line}. It should be within the range of lines of the file: [0, {n}]"
            ));
        }
        let at = insert_line as usize;
        let new_text = expand_tabs(new_str);
        let new_lines: Vec<&str> = new_text.split('\n').collect();

        let updated: Vec<&str> = lines[..at]
            .iter()
            .chain(&new_lines)
            .chain(&lines[at..])
            .copied()
            .collect();
        let before = at.saturating_sub(SNIPPET_LINES);
        let after = (at + SNIPPET_LINES).min(n);
        let snippet: Vec<&str> = lines[before..at]
            .iter()
            .chain(&new_lines)
            .chain(&lines[at..after])
            .copied()
            .collect();

        Self::write(path, &updated.join("\n")).await?;
        self.remember(path, original);

        Ok(format!(
            "The file {} has been edited. {}Review the changes and make sure they are as expected (correct indentation, no duplicate lines, etc). Edit the file again if necessary.",
            path.display(),
            numbered(&snippet.join("\n"), "a snippet of the edited file", before + 1)
        ))
    }

    async fn undo_edit(&self, path: &Path) -> Outcome {
        let previous = self
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(path)
            .and_then(Vec::pop);
        let Some(previous) = previous else {
            return Err(format!("No edit history found for {}.", path.display()));
        };
        Self::write(path, &previous).await?;
        Ok(format!(
            "Last edit to {} undone successfully. {}",
            path.display(),
            numbered(&previous, &path.display().to_string(), 1)
        ))
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        self.version.tool_name()
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::builtin(self.version.api_type(), self.version.tool_name())
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "enum": self.version.commands()},
                "path": {"type": "string"},
                "file_text": {"type": "string"},
                "view_range": {"type": "array"},
                "old_str": {"type": "string"},
                "new_str": {"type": "string"},
                "insert_line": {"type": "integer"}
            },
            "required": ["command", "path"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult, ToolError> {
        let command = input["command"].as_str().unwrap_or_default();
        let path = PathBuf::from(input["path"].as_str().unwrap_or_default());
        debug!(command, path = %path.display(), "Editor command");

        if !self.version.commands().contains(&command) {
            return Ok(ToolResult::error(format!(
                "Unrecognized command {command}. The allowed commands for the {} tool are: {}",
                self.version.tool_name(),
                self.version.commands().join(", ")
            )));
        }
        if let Err(e) = self.validate_path(command, &path) {
            return Ok(ToolResult::error(e));
        }

        let outcome = match command {
            "view" => self.view(&path, input.get("view_range").filter(|v| !v.is_null())).await,
            "create" => self.create(&path, input["file_text"].as_str()).await,
            "str_replace" => {
                self.str_replace(&path, input["old_str"].as_str(), input["new_str"].as_str())
                    .await
            }
            "insert" => {
                self.insert(&path, input["insert_line"].as_i64(), input["new_str"].as_str())
                    .await
            }
            _ => self.undo_edit(&path).await,
        };
        Ok(match outcome {
            Ok(output) => ToolResult::output(output),
            Err(error) => ToolResult::error(error),
        })
    }
}
