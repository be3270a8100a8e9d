//! Record ↔ row conversion, driven entirely by the field mapping tables.

use serde_json::{Map, Number, Value};

use crate::driver::{JsonRow, SqlValue};
use crate::error::DatabaseError;
use crate::model::{FieldKind, LegacyAliases, LegacyRecord, RecordSchema};

/// Bind values for one record, in `schema.columns()` order. Legacy aliases
/// the record mirrors are written to the overflow column with the canonical
/// value.
pub fn record_to_row<T: LegacyRecord>(
    schema: &RecordSchema,
    key: &str,
    record: &T,
) -> Result<Vec<SqlValue>, DatabaseError> {
    let mut fields = match serde_json::to_value(record) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => {
            return Err(DatabaseError::Serialization(format!(
                "{}/{key} serialized to {other}, expected an object",
                schema.collection
            )));
        }
        Err(e) => {
            return Err(DatabaseError::Serialization(format!(
                "{}/{key}: {e}",
                schema.collection
            )));
        }
    };

    record.legacy_aliases().sync(&mut fields);

    let mut row = Vec::with_capacity(schema.fields.len() + 2);
    row.push(SqlValue::Text(key.to_string()));
    for spec in schema.fields {
        let value = fields.remove(spec.key).unwrap_or(Value::Null);
        row.push(to_column(spec.kind, value));
    }
    row.push(SqlValue::Text(Value::Object(fields).to_string()));
    Ok(row)
}

fn to_column(kind: FieldKind, value: Value) -> SqlValue {
    match (kind, value) {
        (_, Value::Null) => SqlValue::Null,
        (FieldKind::Boolean, Value::Bool(b)) => SqlValue::Integer(i64::from(b)),
        (FieldKind::Number, Value::Number(n)) => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        (FieldKind::Integer, Value::Number(n)) => SqlValue::Integer(n.as_i64().unwrap_or(0)),
        (FieldKind::Text, Value::String(s)) => SqlValue::Text(s),
        (_, other) => SqlValue::Text(other.to_string()),
    }
}

/// Rebuild `(key, record)` from a row selected with `schema.columns()`.
/// Overflow keys that mirror a canonical column are tracked again as legacy
/// aliases.
pub fn row_to_record<T: LegacyRecord>(
    schema: &RecordSchema,
    mut row: JsonRow,
) -> Result<(String, T), DatabaseError> {
    let key = match row.remove(schema.key_column) {
        Some(Value::String(key)) => key,
        other => {
            return Err(DatabaseError::Serialization(format!(
                "{} row has no text key (found {other:?})",
                schema.table
            )));
        }
    };

    let mut fields = match row.remove(schema.overflow_column) {
        Some(Value::String(text)) => match serde_json::from_str(&text) {
            Ok(Value::Object(extra)) => extra,
            _ => {
                return Err(DatabaseError::Serialization(format!(
                    "{}/{key}: {} is not a JSON object",
                    schema.table, schema.overflow_column
                )));
            }
        },
        _ => Map::new(),
    };

    for spec in schema.fields {
        let raw = row.remove(spec.column).unwrap_or(Value::Null);
        if let Some(value) = from_column(spec.kind, raw) {
            fields.insert(spec.key.to_string(), value);
        }
    }

    let aliases = LegacyAliases::detect(schema, &fields);
    let mut record: T = serde_json::from_value(Value::Object(fields))
        .map_err(|e| DatabaseError::Serialization(format!("{}/{key}: {e}", schema.table)))?;
    record.set_legacy_aliases(aliases);
    Ok((key, record))
}

fn from_column(kind: FieldKind, raw: Value) -> Option<Value> {
    match (kind, raw) {
        (_, Value::Null) => None,
        (FieldKind::Boolean, Value::Number(n)) => Some(Value::Bool(n.as_i64().unwrap_or(0) != 0)),
        (FieldKind::Number, Value::Number(n)) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (FieldKind::Json, Value::String(text)) => {
            Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
        }
        (_, other) => Some(other),
    }
}

/// `SELECT <columns> FROM <table> ORDER BY <key>` for a schema.
pub fn select_all(schema: &RecordSchema) -> String {
    format!(
        "SELECT {} FROM {} ORDER BY {}",
        schema.columns().join(", "),
        schema.table,
        schema.key_column
    )
}

/// Decode a JSON text cell written by this crate.
pub fn json_cell(table: &str, key: &str, cell: Option<Value>) -> Result<Value, DatabaseError> {
    match cell {
        Some(Value::String(text)) => serde_json::from_str(&text)
            .map_err(|e| DatabaseError::Serialization(format!("{table}/{key}: {e}"))),
        Some(Value::Null) | None => Ok(Value::Null),
        Some(other) => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fields::{CHAT_SCHEMA, PANEL_USER_SCHEMA, USER_SCHEMA};
    use crate::model::{ChatRecord, PanelUser, WhatsAppUser};
    use serde_json::json;

    fn as_row(schema: &RecordSchema, values: Vec<SqlValue>) -> JsonRow {
        schema
            .columns()
            .into_iter()
            .zip(values)
            .map(|(column, value)| (column.to_string(), crate::driver::sql_to_json(value)))
            .collect()
    }

    #[test]
    fn user_row_uses_columns_and_overflow() {
        let user: WhatsAppUser = serde_json::from_value(json!({
            "exp": 12.5, "limit": 20, "premium": true, "afk": -1, "pet": "cat"
        }))
        .unwrap();
        let row = record_to_row(&USER_SCHEMA, "1@s.whatsapp.net", &user).unwrap();
        let columns = USER_SCHEMA.columns();
        assert_eq!(row.len(), columns.len());

        let at = |name: &str| columns.iter().position(|c| *c == name).unwrap();
        assert!(matches!(&row[at("jid")], SqlValue::Text(k) if k == "1@s.whatsapp.net"));
        assert!(matches!(row[at("daily_limit")], SqlValue::Real(f) if f == 20.0));
        assert!(matches!(row[at("premium")], SqlValue::Integer(1)));
        assert!(matches!(row[at("name")], SqlValue::Null));
        assert!(matches!(&row[at("extra")], SqlValue::Text(t) if t == r#"{"pet":"cat"}"#));
    }

    #[test]
    fn user_survives_the_row_trip() {
        let user: WhatsAppUser = serde_json::from_value(json!({
            "name": "Ayu", "exp": 40.25, "level": 3, "banned": true,
            "afk": 1700000000, "afkReason": "sleep", "inventory": {"potion": 2}
        }))
        .unwrap();
        let row = as_row(&USER_SCHEMA, record_to_row(&USER_SCHEMA, "k", &user).unwrap());
        let (key, back): (String, WhatsAppUser) = row_to_record(&USER_SCHEMA, row).unwrap();
        assert_eq!(key, "k");
        assert_eq!(back, user);
    }

    #[test]
    fn chat_templates_survive_the_row_trip() {
        let chat = ChatRecord {
            welcome: true,
            s_welcome: Some("Hi @user".into()),
            expired: 99,
            ..Default::default()
        };
        let row = as_row(&CHAT_SCHEMA, record_to_row(&CHAT_SCHEMA, "g@g.us", &chat).unwrap());
        assert_eq!(row["welcome_text"], json!("Hi @user"));
        let (_, back): (String, ChatRecord) = row_to_record(&CHAT_SCHEMA, row).unwrap();
        assert_eq!(back, chat);
    }

    #[test]
    fn panel_user_json_columns_keep_their_type() {
        let user: PanelUser = serde_json::from_value(json!({
            "username": "admin", "password": "$2b$10$x", "createdAt": 1700000000,
            "lastLogin": {"ip": "10.0.0.1"}, "theme": "dark"
        }))
        .unwrap();
        let row = as_row(
            &PANEL_USER_SCHEMA,
            record_to_row(&PANEL_USER_SCHEMA, "admin", &user).unwrap(),
        );
        assert_eq!(row["password_hash"], json!("$2b$10$x"));
        let (_, back): (String, PanelUser) = row_to_record(&PANEL_USER_SCHEMA, row).unwrap();
        assert_eq!(back.created_at, Some(json!(1700000000)));
        assert_eq!(back.last_login, Some(json!({"ip": "10.0.0.1"})));
        assert_eq!(back.metadata["theme"], json!("dark"));
    }

    #[test]
    fn mirrored_alias_is_written_and_tracked_again() {
        let load = crate::model::load_legacy(
            json!({"chats": {"g@g.us": {"antilink": true}}}),
            false,
        )
        .unwrap();
        let mut chat = load.snapshot.chats["g@g.us"].clone();
        chat.anti_link = false;

        let row = as_row(&CHAT_SCHEMA, record_to_row(&CHAT_SCHEMA, "g@g.us", &chat).unwrap());
        assert_eq!(row["anti_link"], json!(0));
        assert_eq!(row["extra"], json!(r#"{"antilink":false}"#));

        let (_, back): (String, ChatRecord) = row_to_record(&CHAT_SCHEMA, row).unwrap();
        assert!(back.legacy_aliases.contains("antilink"));
        assert_eq!(back.extra["antilink"], json!(false));
    }

    #[test]
    fn alias_named_overflow_is_left_alone() {
        let user: WhatsAppUser = serde_json::from_value(json!({"exp": 3, "xp": 900})).unwrap();
        let row = as_row(&USER_SCHEMA, record_to_row(&USER_SCHEMA, "k", &user).unwrap());
        let (_, back): (String, WhatsAppUser) = row_to_record(&USER_SCHEMA, row).unwrap();
        assert_eq!(back.extra["xp"], json!(900));
        assert!(back.legacy_aliases.is_empty());
        assert_eq!(back, user);
    }

    #[test]
    fn missing_key_is_an_error() {
        let row = JsonRow::new();
        let err = row_to_record::<ChatRecord>(&CHAT_SCHEMA, row).unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
    }

    #[test]
    fn select_lists_every_column() {
        assert_eq!(
            select_all(&PANEL_USER_SCHEMA),
            "SELECT id, username, password_hash, role, email, active, created_at, last_login, metadata FROM panel_users ORDER BY id"
        );
    }
}
