//! Assert tool: evaluate a small path-expression assertion over JSON.
//!
//! ```text
//! assertion := operand [ comparator literal ]
//! operand   := ("parseInt" | "parseFloat" | "String" | "Boolean") "(" path ")" | path
//! path      := ident ( "." ident | "[" digits "]" )*
//! comparator:= "===" | "!==" | "==" | "!=" | ">=" | "<=" | ">" | "<"
//! literal   := number | quoted-string | "true" | "false" | "null"
//! ```

use async_trait::async_trait;
use serde_json::{Value, json};
use std::cmp::Ordering;
use std::fmt;
use tilt_core::error::ToolError;
use tilt_core::provider::ToolDefinition;
use tilt_core::tool::{Tool, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    ParseInt,
    ParseFloat,
    String,
    Boolean,
}

impl Conversion {
    const ALL: [(&'static str, Conversion); 4] = [
        ("parseInt", Conversion::ParseInt),
        ("parseFloat", Conversion::ParseFloat),
        ("String", Conversion::String),
        ("Boolean", Conversion::Boolean),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    StrictEq,
    StrictNe,
    LooseEq,
    LooseNe,
    Ge,
    Le,
    Gt,
    Lt,
}

impl Comparator {
    /// Longest tokens first so `===` is never read as `==`.
    const TOKENS: [(&'static str, Comparator); 8] = [
        ("===", Comparator::StrictEq),
        ("!==", Comparator::StrictNe),
        ("==", Comparator::LooseEq),
        ("!=", Comparator::LooseNe),
        (">=", Comparator::Ge),
        ("<=", Comparator::Le),
        (">", Comparator::Gt),
        ("<", Comparator::Lt),
    ];

    fn token(self) -> &'static str {
        Self::TOKENS
            .iter()
            .find(|(_, c)| *c == self)
            .map(|(t, _)| *t)
            .unwrap_or("?")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
struct Assertion {
    conversion: Option<Conversion>,
    path_text: String,
    path: Vec<Segment>,
    comparison: Option<(Comparator, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_error(message: impl Into<String>) -> ParseError {
    ParseError(message.into())
}

/// Position and kind of the first comparator outside a quoted string.
fn find_comparator(text: &str) -> Option<(usize, Comparator)> {
    let mut quote: Option<char> = None;
    for (i, ch) in text.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None => {
                let rest = &text[i..];
                if let Some((_, cmp)) = Comparator::TOKENS.iter().find(|(t, _)| rest.starts_with(t)) {
                    return Some((i, *cmp));
                }
            }
        }
    }
    None
}

fn parse_path(text: &str) -> Result<Vec<Segment>, ParseError> {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$';
    let mut segments = Vec::new();
    let mut chars = text.chars().peekable();
    let mut expect_ident = true;

    while let Some(&ch) = chars.peek() {
        if expect_ident {
            let mut ident = String::new();
            while let Some(&c) = chars.peek().filter(|c| is_ident(**c)) {
                ident.push(c);
                chars.next();
            }
            if ident.is_empty() {
                return Err(parse_error(format!("expected a property name in path '{text}'")));
            }
            segments.push(Segment::Key(ident));
            expect_ident = false;
            continue;
        }
        match ch {
            '.' => {
                chars.next();
                expect_ident = true;
            }
            '[' => {
                chars.next();
                let mut digits = String::new();
                while let Some(&c) = chars.peek().filter(|c| c.is_ascii_digit()) {
                    digits.push(c);
                    chars.next();
                }
                if chars.next() != Some(']') || digits.is_empty() {
                    return Err(parse_error(format!("invalid index in path '{text}'")));
                }
                let index = digits
                    .parse()
                    .map_err(|_| parse_error(format!("index out of range in path '{text}'")))?;
                segments.push(Segment::Index(index));
            }
            other => {
                return Err(parse_error(format!("unexpected '{other}' in path '{text}'")));
            }
        }
    }
    if expect_ident {
        return Err(parse_error(format!("path '{text}' is incomplete")));
    }
    Ok(segments)
}

fn parse_literal(text: &str) -> Result<Value, ParseError> {
    let text = text.trim();
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        return Ok(Value::String(text[1..text.len() - 1].to_string()));
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Number(_) | Value::String(_) | Value::Bool(_) | Value::Null)) => Ok(value),
        _ => Err(parse_error(format!("invalid literal '{text}'"))),
    }
}

fn parse_assertion(text: &str) -> Result<Assertion, ParseError> {
    let (operand, comparison) = match find_comparator(text) {
        Some((at, cmp)) => {
            let literal = parse_literal(&text[at + cmp.token().len()..])?;
            (text[..at].trim(), Some((cmp, literal)))
        }
        None => (text.trim(), None),
    };

    let mut conversion = None;
    let mut path_text = operand;
    for (name, conv) in Conversion::ALL {
        if let Some(inner) = operand
            .strip_prefix(name)
            .map(str::trim_start)
            .and_then(|s| s.strip_prefix('('))
        {
            let inner = inner
                .strip_suffix(')')
                .ok_or_else(|| parse_error(format!("missing ')' after {name}(")))?;
            conversion = Some(conv);
            path_text = inner.trim();
            break;
        }
    }

    Ok(Assertion {
        conversion,
        path_text: path_text.to_string(),
        path: parse_path(path_text)?,
        comparison,
    })
}

fn lookup<'a>(data: &'a Value, path: &[Segment]) -> Option<&'a Value> {
    path.iter().try_fold(data, |current, segment| match segment {
        Segment::Key(key) => current.get(key.as_str()),
        Segment::Index(i) => current.get(*i),
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Leading integer of a string, the way `parseInt` reads it.
fn leading_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let sign_len = usize::from(text.starts_with(['-', '+']));
    let digits = text[sign_len..].chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    text[..sign_len + digits].parse().ok()
}

/// Longest numeric prefix of a string, the way `parseFloat` reads it.
fn leading_float(text: &str) -> Option<f64> {
    let text = text.trim_start();
    (1..=text.len())
        .rev()
        .filter(|end| text.is_char_boundary(*end))
        .find_map(|end| text[..end].parse::<f64>().ok().filter(|f| f.is_finite()))
}

fn convert(value: &Value, conversion: Conversion) -> Result<Value, String> {
    match conversion {
        Conversion::ParseInt => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(Value::from)
                .ok_or_else(|| format!("Cannot convert '{}' to integer", display(value))),
            Value::String(s) => leading_int(s)
                .map(Value::from)
                .ok_or_else(|| format!("Cannot convert '{s}' to integer")),
            other => Err(format!("Cannot convert '{}' to integer", display(other))),
        },
        Conversion::ParseFloat => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => leading_float(s)
                .map(Value::from)
                .ok_or_else(|| format!("Cannot convert '{s}' to number")),
            other => Err(format!("Cannot convert '{}' to number", display(other))),
        },
        Conversion::String => Ok(Value::String(display(value))),
        Conversion::Boolean => Ok(Value::Bool(truthy(value))),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if strict_eq(a, b) {
        return true;
    }
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(x), Value::String(y)) => x == y,
        _ => matches!((as_number(a), as_number(b)), (Some(x), Some(y)) if x == y),
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => as_number(a)?.partial_cmp(&as_number(b)?),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Outcome {
    success: bool,
    value: Value,
    message: String,
}

fn evaluate(assertion: &Assertion, data: &Value) -> Outcome {
    let found = lookup(data, &assertion.path).filter(|v| !v.is_null());
    let Some(raw) = found else {
        return Outcome {
            success: false,
            value: Value::Null,
            message: format!("Path '{}' not found in data", assertion.path_text),
        };
    };

    let actual = match assertion.conversion.map(|c| convert(raw, c)) {
        None => raw.clone(),
        Some(Ok(converted)) => converted,
        Some(Err(message)) => {
            return Outcome {
                success: false,
                value: raw.clone(),
                message,
            };
        }
    };

    let Some((cmp, expected)) = &assertion.comparison else {
        let success = truthy(&actual);
        let state = if success { "truthy" } else { "falsy" };
        return Outcome {
            success,
            message: format!("Value at '{}' is {state}", assertion.path_text),
            value: actual,
        };
    };

    let (success, message) = match cmp {
        Comparator::StrictEq | Comparator::LooseEq => {
            let success = if *cmp == Comparator::StrictEq {
                strict_eq(&actual, expected)
            } else {
                loose_eq(&actual, expected)
            };
            (success, format!("Expected {}, got {}", display(expected), display(&actual)))
        }
        Comparator::StrictNe | Comparator::LooseNe => {
            let equal = if *cmp == Comparator::StrictNe {
                strict_eq(&actual, expected)
            } else {
                loose_eq(&actual, expected)
            };
            (
                !equal,
                format!("Expected value other than {}, got {}", display(expected), display(&actual)),
            )
        }
        Comparator::Ge | Comparator::Le | Comparator::Gt | Comparator::Lt => {
            let success = order(&actual, expected).is_some_and(|o| match cmp {
                Comparator::Ge => o != Ordering::Less,
                Comparator::Le => o != Ordering::Greater,
                Comparator::Gt => o == Ordering::Greater,
                _ => o == Ordering::Less,
            });
            (
                success,
                format!("Expected value {} {}, got {}", cmp.token(), display(expected), display(&actual)),
            )
        }
    };
    Outcome {
        success,
        value: actual,
        message,
    }
}

/// Validate JSON data against an assertion and extract the addressed value.
pub struct AssertTool;

#[async_trait]
impl Tool for AssertTool {
    fn name(&self) -> &str {
        "assert"
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::custom(
            "assert",
            "Validate JSON data against assertions and extract specific values",
            self.input_schema(),
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "json_data": {
                    "type": "string",
                    "description": "JSON string to validate and extract data from"
                },
                "assertion": {
                    "type": "string",
                    "description": "JavaScript-like assertion expression to evaluate (e.g., 'parseInt(events.xdm.analytics.event118.value) === 1')"
                }
            },
            "required": ["json_data", "assertion"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult, ToolError> {
        let json_data = input["json_data"].as_str().unwrap_or_default();
        let assertion_text = input["assertion"].as_str().unwrap_or_default();

        if json_data.trim().is_empty() {
            return Ok(ToolResult::error("JSON data cannot be empty"));
        }
        if assertion_text.trim().is_empty() {
            return Ok(ToolResult::error("Assertion cannot be empty"));
        }

        let data: Value = match serde_json::from_str(json_data) {
            Ok(data) => data,
            Err(e) => return Ok(ToolResult::error(format!("Invalid JSON data: {e}"))),
        };
        let assertion = match parse_assertion(assertion_text) {
            Ok(assertion) => assertion,
            Err(e) => return Ok(ToolResult::error(format!("Invalid assertion: {e}"))),
        };

        let outcome = evaluate(&assertion, &data);
        let output = json!({
            "assertion": assertion_text,
            "result": outcome.success,
            "extracted_value": outcome.value,
            "message": outcome.message,
        });
        serde_json::to_string_pretty(&output)
            .map(ToolResult::output)
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "assert".into(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(data: Value, assertion: &str) -> Outcome {
        evaluate(&parse_assertion(assertion).unwrap(), &data)
    }

    #[test]
    fn parses_conversion_path_and_literal() {
        let parsed = parse_assertion("parseInt(events[0].xdm.value) === 1").unwrap();
        assert_eq!(parsed.conversion, Some(Conversion::ParseInt));
        assert_eq!(parsed.path_text, "events[0].xdm.value");
        assert_eq!(
            parsed.path,
            vec![
                Segment::Key("events".into()),
                Segment::Index(0),
                Segment::Key("xdm".into()),
                Segment::Key("value".into()),
            ]
        );
        assert_eq!(parsed.comparison, Some((Comparator::StrictEq, json!(1))));
    }

    #[test]
    fn comparator_inside_quotes_is_literal_text() {
        let parsed = parse_assertion("name == 'a<b'").unwrap();
        assert_eq!(parsed.comparison, Some((Comparator::LooseEq, json!("a<b"))));
    }

    #[test]
    fn rejects_malformed_assertions() {
        assert!(parse_assertion("parseInt(a.b === 1").is_err());
        assert!(parse_assertion("a..b").is_err());
        assert!(parse_assertion("a[x] == 1").is_err());
        assert!(parse_assertion("a == banana").is_err());
    }

    #[test]
    fn parse_int_of_string_value() {
        let data = json!({"events": {"event118": {"value": "1"}}});
        let outcome = run(data, "parseInt(events.event118.value) === 1");
        assert!(outcome.success);
        assert_eq!(outcome.value, json!(1));
        assert_eq!(outcome.message, "Expected 1, got 1");
    }

    #[test]
    fn strict_and_loose_equality_differ_on_types() {
        let data = json!({"count": "3"});
        assert!(!run(data.clone(), "count === 3").success);
        assert!(run(data.clone(), "count == 3").success);
        assert!(run(data, "count !== 3").success);
    }

    #[test]
    fn ordering_comparisons() {
        let data = json!({"items": [{"price": 9.5}], "name": "beta"});
        assert!(run(data.clone(), "items[0].price > 9").success);
        assert!(run(data.clone(), "items[0].price <= 9.5").success);
        assert!(!run(data.clone(), "items[0].price < 9").success);
        assert!(run(data, "name >= \"alpha\"").success);
    }

    #[test]
    fn bare_path_checks_truthiness() {
        let data = json!({"ok": true, "empty": "", "zero": 0});
        assert!(run(data.clone(), "ok").success);
        assert!(!run(data.clone(), "empty").success);
        let outcome = run(data, "Boolean(zero)");
        assert!(!outcome.success);
        assert_eq!(outcome.value, json!(false));
    }

    #[test]
    fn missing_path_is_reported() {
        let outcome = run(json!({"a": {}}), "parseInt(a.b.c) === 1");
        assert!(!outcome.success);
        assert_eq!(outcome.value, Value::Null);
        assert_eq!(outcome.message, "Path 'a.b.c' not found in data");
    }

    #[test]
    fn unconvertible_value_is_reported() {
        let outcome = run(json!({"v": "abc"}), "parseInt(v) === 1");
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Cannot convert 'abc' to integer");
    }

    #[test]
    fn numeric_prefixes() {
        assert_eq!(leading_int(" 42px"), Some(42));
        assert_eq!(leading_int("-7"), Some(-7));
        assert_eq!(leading_int("px"), None);
        assert_eq!(leading_float("3.25em"), Some(3.25));
    }

    #[tokio::test]
    async fn tool_output_is_pretty_json() {
        let result = AssertTool
            .execute(json!({
                "json_data": r#"{"user": {"name": "Ada"}}"#,
                "assertion": "String(user.name) === 'Ada'"
            }))
            .await
            .unwrap();
        let output: Value = serde_json::from_str(result.output.as_deref().unwrap()).unwrap();
        assert_eq!(output["result"], json!(true));
        assert_eq!(output["extracted_value"], json!("Ada"));
        assert_eq!(output["assertion"], json!("String(user.name) === 'Ada'"));
    }

    #[tokio::test]
    async fn tool_input_errors() {
        let empty = AssertTool
            .execute(json!({"json_data": " ", "assertion": "a"}))
            .await
            .unwrap();
        assert_eq!(empty.error.as_deref(), Some("JSON data cannot be empty"));

        let no_assertion = AssertTool
            .execute(json!({"json_data": "{}", "assertion": ""}))
            .await
            .unwrap();
        assert_eq!(no_assertion.error.as_deref(), Some("Assertion cannot be empty"));

        let bad_json = AssertTool
            .execute(json!({"json_data": "{nope", "assertion": "a"}))
            .await
            .unwrap();
        assert!(bad_json.error.unwrap().starts_with("Invalid JSON data:"));
    }
}
