//! Read-only SQLite query tool, for checking what an application under test
//! actually wrote to its database.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteRow};
use sqlx::{Arguments, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use tilt_core::error::ToolError;
use tilt_core::provider::ToolDefinition;
use tilt_core::tool::{Tool, ToolResult};
use tracing::debug;

const DEFAULT_LIMIT: i64 = 10;
const MAX_LIMIT: i64 = 100;

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn connect_options(connection_string: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    let options = if connection_string.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(connection_string)?
    } else {
        SqliteConnectOptions::new().filename(connection_string)
    };
    Ok(options.read_only(true).create_if_missing(false))
}

/// A parameterised SELECT plus its bind values.
#[derive(Debug)]
struct Query {
    sql: String,
    binds: Vec<Value>,
}

fn build_query(
    table: &str,
    filter: &Map<String, Value>,
    columns: &[String],
    order_by: &Map<String, Value>,
    limit: i64,
) -> Query {
    let projection = if columns.is_empty() {
        "*".to_string()
    } else {
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
    };
    let mut sql = format!("SELECT {projection} FROM {}", quote_ident(table));
    let mut binds = Vec::new();

    let conditions: Vec<String> = filter
        .iter()
        .map(|(column, value)| {
            if value.is_null() {
                format!("{} IS NULL", quote_ident(column))
            } else {
                binds.push(value.clone());
                format!("{} = ?", quote_ident(column))
            }
        })
        .collect();
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if !order_by.is_empty() {
        let terms: Vec<String> = order_by
            .iter()
            .map(|(column, direction)| {
                let dir = if direction.as_i64() == Some(-1) { "DESC" } else { "ASC" };
                format!("{} {dir}", quote_ident(column))
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
    }
    sql.push_str(&format!(" LIMIT {limit}"));
    Query { sql, binds }
}

fn bind_arguments(binds: &[Value]) -> Result<SqliteArguments<'static>, String> {
    let mut args = SqliteArguments::default();
    for value in binds {
        let added = match value {
            Value::Bool(b) => args.add(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => args.add(i),
                None => args.add(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => args.add(s.clone()),
            other => args.add(other.to_string()),
        };
        added.map_err(|e| e.to_string())?;
    }
    Ok(args)
}

/// Convert one row to a JSON object using each value's storage class.
fn row_to_json(row: &SqliteRow) -> Map<String, Value> {
    let mut object = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = sqlx::Column::name(column).to_string();
        let value = match row.try_get_raw(i) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(i).map(Value::from).unwrap_or(Value::Null),
                "REAL" | "NUMERIC" => row.try_get_unchecked::<f64, _>(i).map(Value::from).unwrap_or(Value::Null),
                "BLOB" => row
                    .try_get_unchecked::<Vec<u8>, _>(i)
                    .map(|bytes| Value::String(STANDARD.encode(bytes)))
                    .unwrap_or(Value::Null),
                _ => row.try_get_unchecked::<String, _>(i).map(Value::String).unwrap_or(Value::Null),
            },
            Err(_) => Value::Null,
        };
        object.insert(name, value);
    }
    object
}

pub struct SqliteQueryTool;

impl SqliteQueryTool {
    async fn query(
        &self,
        connection_string: &str,
        query: &Query,
    ) -> Result<Vec<Map<String, Value>>, String> {
        let options = connect_options(connection_string).map_err(|e| e.to_string())?;
        let mut conn = options.connect().await.map_err(|e| e.to_string())?;
        let args = bind_arguments(&query.binds)?;
        debug!(sql = %query.sql, "Running read-only query");
        let rows = sqlx::query_with(&query.sql, args)
            .fetch_all(&mut conn)
            .await
            .map_err(|e| e.to_string());
        let _ = conn.close().await;
        Ok(rows?.iter().map(row_to_json).collect())
    }
}

#[async_trait]
impl Tool for SqliteQueryTool {
    fn name(&self) -> &str {
        "sqlite_query"
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::custom(
            "sqlite_query",
            "Query a SQLite database to retrieve rows matching specified criteria. Useful for verifying data was inserted correctly, checking database state, or finding specific records. Returns JSON-formatted results.",
            self.input_schema(),
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "connection_string": {
                    "type": "string",
                    "description": "Path to the database file or a sqlite:// URL"
                },
                "table": {"type": "string", "description": "Table to query"},
                "filter": {
                    "type": "object",
                    "description": "Column equality filter, e.g. {\"email\": \"user@example.com\"}. Use {} for all rows"
                },
                "columns": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Columns to return (default: all)"
                },
                "order_by": {
                    "type": "object",
                    "description": "Sort specification, e.g. {\"created_at\": -1} for newest first"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of rows to return (default: 10, max: 100)",
                    "minimum": 1,
                    "maximum": 100
                }
            },
            "required": ["connection_string", "table"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult, ToolError> {
        let connection_string = input["connection_string"].as_str().unwrap_or_default();
        if connection_string.trim().is_empty() {
            return Ok(ToolResult::error("SQLite connection string is required"));
        }
        let table = input["table"].as_str().unwrap_or_default();
        if table.trim().is_empty() {
            return Ok(ToolResult::error("Table name is required"));
        }
        let empty = Map::new();
        let filter = input["filter"].as_object().unwrap_or(&empty);
        let order_by = input["order_by"].as_object().unwrap_or(&empty);
        let columns: Vec<String> = input["columns"]
            .as_array()
            .map(|c| c.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let limit = input["limit"].as_i64().unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        let query = build_query(table, filter, &columns, order_by, limit);
        let rows = match self.query(connection_string, &query).await {
            Ok(rows) => rows,
            Err(e) => return Ok(ToolResult::error(format!("SQLite error: {e}"))),
        };

        let response = json!({
            "table": table,
            "filter": filter,
            "count": rows.len(),
            "limit": limit,
            "results": rows,
        });
        serde_json::to_string_pretty(&response)
            .map(ToolResult::output)
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "sqlite_query".into(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db").display().to_string();
        let mut conn = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .connect()
            .await
            .unwrap();
        for statement in [
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, score REAL, avatar BLOB, deleted_at TEXT)",
            "INSERT INTO users (email, score, avatar) VALUES ('ada@example.com', 9.5, x'0102')",
            "INSERT INTO users (email, score) VALUES ('bob@example.com', 7.0)",
            "INSERT INTO users (email, score, deleted_at) VALUES ('cy@example.com', 8.25, '2024-01-01')",
        ] {
            sqlx::query(statement).execute(&mut conn).await.unwrap();
        }
        conn.close().await.unwrap();
        (dir, path)
    }

    async fn run(input: Value) -> Value {
        let result = SqliteQueryTool.execute(input).await.unwrap();
        serde_json::from_str(result.output.as_deref().expect("output")).unwrap()
    }

    #[test]
    fn query_is_parameterised_and_quoted() {
        let filter = json!({"email": "a@b.c", "deleted_at": null});
        let order = json!({"score": -1});
        let query = build_query(
            "my \"users\"",
            filter.as_object().unwrap(),
            &["id".into(), "email".into()],
            order.as_object().unwrap(),
            5,
        );
        assert_eq!(
            query.sql,
            r#"SELECT "id", "email" FROM "my ""users""" WHERE "deleted_at" IS NULL AND "email" = ? ORDER BY "score" DESC LIMIT 5"#
        );
        assert_eq!(query.binds, vec![json!("a@b.c")]);
    }

    #[tokio::test]
    async fn filters_and_converts_rows() {
        let (_dir, path) = fixture().await;
        let output = run(json!({
            "connection_string": path,
            "table": "users",
            "filter": {"email": "ada@example.com"}
        }))
        .await;
        assert_eq!(output["count"], json!(1));
        assert_eq!(output["limit"], json!(10));
        let row = &output["results"][0];
        assert_eq!(row["id"], json!(1));
        assert_eq!(row["score"], json!(9.5));
        assert_eq!(row["avatar"], json!("AQI="));
        assert_eq!(row["deleted_at"], Value::Null);
    }

    #[tokio::test]
    async fn ordering_columns_and_limit() {
        let (_dir, path) = fixture().await;
        let output = run(json!({
            "connection_string": format!("sqlite://{path}"),
            "table": "users",
            "columns": ["email"],
            "order_by": {"score": -1},
            "limit": 2
        }))
        .await;
        assert_eq!(
            output["results"],
            json!([{"email": "ada@example.com"}, {"email": "cy@example.com"}])
        );
    }

    #[tokio::test]
    async fn connection_is_read_only() {
        let (_dir, path) = fixture().await;
        let mut conn = connect_options(&path).unwrap().connect().await.unwrap();
        let write = sqlx::query("DELETE FROM users").execute(&mut conn).await;
        assert!(write.is_err());
    }

    #[tokio::test]
    async fn errors_are_reported() {
        let missing = SqliteQueryTool
            .execute(json!({"connection_string": "/nonexistent/dir/app.db", "table": "users"}))
            .await
            .unwrap();
        assert!(missing.error.unwrap().starts_with("SQLite error:"));

        let (_dir, path) = fixture().await;
        let bad_table = SqliteQueryTool
            .execute(json!({"connection_string": path, "table": "nope"}))
            .await
            .unwrap();
        assert!(bad_table.error.unwrap().contains("no such table"));
    }
}
