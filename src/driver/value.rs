//! Conversions between libsql values and JSON, plus identifier checks for the
//! few places SQL text is assembled from names.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::error::DatabaseError;

pub use libsql::Value as SqlValue;

/// A result row as column name → JSON value.
pub type JsonRow = Map<String, Value>;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier regex"));

static JSON_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$(\.[A-Za-z_][A-Za-z0-9_]*|\[[0-9]+\])*$").expect("json path regex")
});

/// Reject anything that is not a plain table/column name.
pub fn check_identifier(name: &str) -> Result<&str, DatabaseError> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

/// Reject anything that is not a simple `$.a.b[0]` JSON path.
pub fn check_json_path(path: &str) -> Result<&str, DatabaseError> {
    if JSON_PATH.is_match(path) {
        Ok(path)
    } else {
        Err(DatabaseError::InvalidIdentifier(path.to_string()))
    }
}

/// libsql value → JSON. Non-finite reals become null; blobs become byte arrays.
pub fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
    }
}

/// JSON → libsql value. Booleans become 0/1; arrays and objects are stored as
/// JSON text.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Drain a libsql result set into JSON rows.
pub async fn collect_rows(mut rows: libsql::Rows) -> Result<Vec<JsonRow>, libsql::Error> {
    let names: Vec<String> = (0..rows.column_count())
        .map(|i| rows.column_name(i).unwrap_or_default().to_string())
        .collect();
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        let mut map = Map::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            map.insert(name.clone(), sql_to_json(row.get_value(i as i32)?));
        }
        out.push(map);
    }
    Ok(out)
}

/// Shorten SQL for log lines.
pub(crate) fn preview(sql: &str) -> String {
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 120 {
        format!("{}…", flat.chars().take(120).collect::<String>())
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers() {
        assert!(check_identifier("whatsapp_users").is_ok());
        assert!(check_identifier("users; DROP TABLE x").is_err());
        assert!(check_identifier("1table").is_err());
        assert!(check_identifier("").is_err());
    }

    #[test]
    fn json_paths() {
        assert!(check_json_path("$").is_ok());
        assert!(check_json_path("$.theme").is_ok());
        assert!(check_json_path("$.prefs.items[2]").is_ok());
        assert!(check_json_path("$.a') --").is_err());
        assert!(check_json_path("theme").is_err());
    }

    #[test]
    fn value_conversions() {
        assert_eq!(sql_to_json(SqlValue::Integer(3)), json!(3));
        assert_eq!(sql_to_json(SqlValue::Real(f64::NAN)), Value::Null);
        assert_eq!(sql_to_json(SqlValue::Text("x".into())), json!("x"));
        assert!(matches!(json_to_sql(&json!(true)), SqlValue::Integer(1)));
        assert!(matches!(json_to_sql(&json!(2.5)), SqlValue::Real(f) if f == 2.5));
        assert!(matches!(json_to_sql(&json!({"a": 1})), SqlValue::Text(ref s) if s == r#"{"a":1}"#));
    }

    #[test]
    fn preview_truncates() {
        let long = format!("SELECT {} FROM t", "x, ".repeat(100));
        assert!(preview(&long).ends_with('…'));
        assert_eq!(preview("SELECT\n  1"), "SELECT 1");
    }
}
