//! Field mapping tables, one per record type.
//!
//! Each table ties the JSON key consumers read (the legacy shape), the
//! relational column, the value kind, and the legacy aliases accepted on
//! ingest. The same table drives validation, alias reconciliation, and the
//! column mapping in the relational backend, so key handling lives in exactly
//! one place.
//!
//! A legacy alias found on a record is kept next to its canonical key and
//! tracked in [`LegacyAliases`]; on save every tracked alias is rewritten
//! from the canonical value. Alias-named keys that disagree with a present
//! canonical key are plain overflow data and pass through untouched.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::ValidationError;

/// How a field is typed and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Finite float, stored as REAL.
    Number,
    /// Whole number, stored as INTEGER.
    Integer,
    /// Flag, stored as INTEGER 0/1.
    Boolean,
    /// String, stored as TEXT.
    Text,
    /// Opaque JSON value, stored as TEXT.
    Json,
}

/// One mapped field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
    pub aliases: &'static [&'static str],
}

const fn field(
    key: &'static str,
    column: &'static str,
    kind: FieldKind,
    aliases: &'static [&'static str],
) -> FieldSpec {
    FieldSpec {
        key,
        column,
        kind,
        aliases,
    }
}

/// Mapping for one record type.
#[derive(Debug)]
pub struct RecordSchema {
    /// Collection name in the snapshot.
    pub collection: &'static str,
    pub table: &'static str,
    pub key_column: &'static str,
    pub fields: &'static [FieldSpec],
    /// JSON column holding every key not in `fields`.
    pub overflow_column: &'static str,
}

impl RecordSchema {
    /// All columns in insert order: key, mapped fields, overflow.
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = Vec::with_capacity(self.fields.len() + 2);
        columns.push(self.key_column);
        columns.extend(self.fields.iter().map(|f| f.column));
        columns.push(self.overflow_column);
        columns
    }

    pub fn field(&self, key: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Every `(alias, canonical key)` pair in table order.
    fn alias_pairs(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.fields
            .iter()
            .flat_map(|f| f.aliases.iter().map(move |alias| (*alias, f.key)))
    }
}

/// Legacy alias keys a record mirrors from their canonical key.
///
/// Bookkeeping only: it is never serialized and never affects equality.
#[derive(Debug, Clone, Default)]
pub struct LegacyAliases(BTreeMap<&'static str, &'static str>);

impl PartialEq for LegacyAliases {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl LegacyAliases {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.0.contains_key(alias)
    }

    /// Alias names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.keys().copied()
    }

    /// Rewrite every tracked alias from its canonical key. A missing
    /// canonical key leaves the alias `null`.
    pub fn sync(&self, fields: &mut Map<String, Value>) {
        for (alias, canonical) in &self.0 {
            let value = fields.get(*canonical).cloned().unwrap_or(Value::Null);
            fields.insert(alias.to_string(), value);
        }
    }

    /// Aliases already in agreement with their canonical key. Used when the
    /// record comes back from a backend this crate wrote.
    pub fn detect(schema: &RecordSchema, fields: &Map<String, Value>) -> Self {
        let mut found = BTreeMap::new();
        for (alias, canonical) in schema.alias_pairs() {
            if let Some(value) = fields.get(alias) {
                if fields.get(canonical).unwrap_or(&Value::Null) == value {
                    found.insert(alias, canonical);
                }
            }
        }
        Self(found)
    }
}

use FieldKind::*;

pub static USER_SCHEMA: RecordSchema = RecordSchema {
    collection: "users",
    table: "whatsapp_users",
    key_column: "jid",
    fields: &[
        field("name", "name", Text, &[]),
        field("exp", "exp", Number, &["experience", "xp"]),
        field("money", "money", Number, &["coin", "currency"]),
        field("limit", "daily_limit", Number, &[]),
        field("level", "level", Integer, &[]),
        field("health", "health", Number, &["hp"]),
        field("role", "role", Text, &[]),
        field("premium", "premium", Boolean, &["isPremium"]),
        field("premiumTime", "premium_time", Integer, &["premiumtime"]),
        field("banned", "banned", Boolean, &["isBanned"]),
        field("warn", "warn", Integer, &["warning", "warnings"]),
        field("commandCount", "command_count", Integer, &["commands", "cmd"]),
        field("afk", "afk_since", Integer, &[]),
        field("afkReason", "afk_reason", Text, &["afkreason"]),
        field("registered", "registered", Boolean, &[]),
    ],
    overflow_column: "extra",
};

pub static CHAT_SCHEMA: RecordSchema = RecordSchema {
    collection: "chats",
    table: "chats",
    key_column: "jid",
    fields: &[
        field("isBanned", "is_banned", Boolean, &["isbanned"]),
        field("welcome", "welcome", Boolean, &[]),
        field("detect", "detect", Boolean, &[]),
        field("antiLink", "anti_link", Boolean, &["antilink"]),
        field("antiDelete", "anti_delete", Boolean, &["antidelete", "delete"]),
        field("onlyAdmin", "only_admin", Boolean, &["modoadmin"]),
        field("nsfw", "nsfw", Boolean, &["modohorny"]),
        field("sWelcome", "welcome_text", Text, &["welcomeMessage"]),
        field("sBye", "bye_text", Text, &["byeMessage"]),
        field("sPromote", "promote_text", Text, &["promoteMessage"]),
        field("sDemote", "demote_text", Text, &["demoteMessage"]),
        field("expired", "expires_at", Integer, &[]),
    ],
    overflow_column: "extra",
};

pub static PANEL_USER_SCHEMA: RecordSchema = RecordSchema {
    collection: "panelUsers",
    table: "panel_users",
    key_column: "id",
    fields: &[
        field("username", "username", Text, &[]),
        field("password", "password_hash", Text, &["passwordHash"]),
        field("role", "role", Text, &[]),
        field("email", "email", Text, &[]),
        field("active", "active", Boolean, &["enabled"]),
        field("createdAt", "created_at", Json, &[]),
        field("lastLogin", "last_login", Json, &["lastLoginAt"]),
    ],
    overflow_column: "metadata",
};

/// A record after alias folding and coercion.
#[derive(Debug, Clone, Default)]
pub struct NormalizedRecord {
    pub fields: Map<String, Value>,
    pub aliases: LegacyAliases,
    /// One entry per coerced field. Empty when the record was clean.
    pub coercions: Vec<ValidationError>,
}

/// Fold aliases into canonical keys and coerce every mapped field.
///
/// Fails only when the record itself is not a JSON object; field-level
/// problems are coerced and reported in `coercions`.
pub fn normalize_record(
    schema: &RecordSchema,
    key: &str,
    value: Value,
) -> Result<NormalizedRecord, ValidationError> {
    let mut fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Err(ValidationError {
                collection: schema.collection.to_string(),
                key: key.to_string(),
                field: "*".to_string(),
                reason: format!("is not an object (found {})", type_name(&other)),
            });
        }
    };

    let aliases = fold_aliases(schema, &mut fields);

    let mut coercions = Vec::new();
    for spec in schema.fields {
        let Some(raw) = fields.remove(spec.key) else {
            continue;
        };
        if raw.is_null() && matches!(spec.kind, Text | Json) {
            continue;
        }
        let (coerced, reason) = coerce(spec.kind, raw);
        if let Some(reason) = reason {
            coercions.push(ValidationError {
                collection: schema.collection.to_string(),
                key: key.to_string(),
                field: spec.key.to_string(),
                reason,
            });
        }
        fields.insert(spec.key.to_string(), coerced);
    }
    aliases.sync(&mut fields);

    Ok(NormalizedRecord {
        fields,
        aliases,
        coercions,
    })
}

/// Copy legacy alias values onto an absent canonical key and track the
/// aliases that mirror it. The canonical key wins when both are present; an
/// alias holding a different value stays as ordinary overflow.
pub fn fold_aliases(schema: &RecordSchema, fields: &mut Map<String, Value>) -> LegacyAliases {
    let mut found = BTreeMap::new();
    for (alias, canonical) in schema.alias_pairs() {
        let Some(value) = fields.get(alias).cloned() else {
            continue;
        };
        match fields.get(canonical) {
            None => {
                fields.insert(canonical.to_string(), value);
                found.insert(alias, canonical);
            }
            Some(current) if *current == value => {
                found.insert(alias, canonical);
            }
            Some(_) => {}
        }
    }
    LegacyAliases(found)
}

/// Give every alias-named key an explicit canonical key, `null` when the
/// canonical field is unset, so a later ingest of the same document keeps
/// the alias as overflow instead of folding it.
pub fn pin_canonical_keys(schema: &RecordSchema, fields: &mut Map<String, Value>) {
    for (alias, canonical) in schema.alias_pairs() {
        if fields.contains_key(alias) && !fields.contains_key(canonical) {
            fields.insert(canonical.to_string(), Value::Null);
        }
    }
}

/// Coerce a raw value to `kind`. Returns the reason when the value had to be
/// changed.
pub fn coerce(kind: FieldKind, raw: Value) -> (Value, Option<String>) {
    match kind {
        Number | Integer => coerce_number(kind == Integer, raw),
        Boolean => match raw {
            Value::Bool(_) => (raw, None),
            Value::Number(ref n) if n.as_i64() == Some(0) => (Value::Bool(false), None),
            Value::Number(ref n) if n.as_i64() == Some(1) => (Value::Bool(true), None),
            other => (
                Value::Bool(false),
                Some(format!("is not a boolean (found {})", describe(&other))),
            ),
        },
        Text => match raw {
            Value::String(_) => (raw, None),
            Value::Number(_) | Value::Bool(_) => {
                let text = raw.to_string();
                (Value::String(text), Some("was not text, stringified".into()))
            }
            other => (
                Value::String(other.to_string()),
                Some(format!("was {}, stringified", type_name(&other))),
            ),
        },
        Json => (raw, None),
    }
}

fn coerce_number(integer: bool, raw: Value) -> (Value, Option<String>) {
    let zero = || Value::from(0);
    match raw {
        Value::Number(ref n) => {
            if !integer || n.is_i64() {
                return (raw, None);
            }
            if let Some(u) = n.as_u64() {
                return match i64::try_from(u) {
                    Ok(i) => (Value::from(i), None),
                    Err(_) => (
                        Value::from(i64::MAX),
                        Some(format!("{u} clamped to {}", i64::MAX)),
                    ),
                };
            }
            match n.as_f64() {
                Some(f) if f.is_finite() => (
                    Value::from(f.trunc() as i64),
                    Some(format!("{f} truncated to an integer")),
                ),
                _ => (zero(), Some("is not a finite number".into())),
            }
        }
        Value::String(ref text) => match text.trim().parse::<f64>() {
            Ok(f) if f.is_finite() => {
                let value = if integer {
                    Value::from(f.trunc() as i64)
                } else {
                    serde_json::Number::from_f64(f).map_or_else(zero, Value::Number)
                };
                (value, Some(format!("parsed from text {text:?}")))
            }
            _ => (
                zero(),
                Some(format!("is not a finite number (found {text:?})")),
            ),
        },
        other => (
            zero(),
            Some(format!("is not a finite number (found {})", describe(&other))),
        ),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{s:?}"),
        Value::Null => "null".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => type_name(other).into(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nan_text_becomes_zero_with_reason() {
        let (value, reason) = coerce(Number, json!("NaN"));
        assert_eq!(value, json!(0));
        assert!(reason.unwrap().contains("finite"));
    }

    #[test]
    fn null_number_becomes_zero() {
        let (value, reason) = coerce(Integer, Value::Null);
        assert_eq!(value, json!(0));
        assert!(reason.is_some());
    }

    #[test]
    fn numeric_text_is_parsed() {
        let (value, reason) = coerce(Number, json!(" 12.5 "));
        assert_eq!(value, json!(12.5));
        assert!(reason.is_some());
    }

    #[test]
    fn integer_truncates_floats() {
        assert_eq!(coerce(Integer, json!(7.9)).0, json!(7));
        assert_eq!(coerce(Integer, json!(7)), (json!(7), None));
    }

    #[test]
    fn booleans() {
        assert_eq!(coerce(Boolean, json!(true)), (json!(true), None));
        assert_eq!(coerce(Boolean, json!(1)), (json!(true), None));
        let (value, reason) = coerce(Boolean, json!("yes"));
        assert_eq!(value, json!(false));
        assert!(reason.unwrap().contains("\"yes\""));
    }

    #[test]
    fn aliases_fold_into_canonical_key() {
        let record = normalize_record(
            &CHAT_SCHEMA,
            "g1@g.us",
            json!({"antilink": true, "modoadmin": 1, "custom": "kept"}),
        )
        .unwrap();
        assert_eq!(record.fields.get("antiLink"), Some(&json!(true)));
        assert_eq!(record.fields.get("onlyAdmin"), Some(&json!(true)));
        // The legacy keys stay readable, mirrored to the coerced value.
        assert_eq!(record.fields.get("antilink"), Some(&json!(true)));
        assert_eq!(record.fields.get("modoadmin"), Some(&json!(true)));
        assert_eq!(record.aliases.names().collect::<Vec<_>>(), vec!["antilink", "modoadmin"]);
        assert_eq!(record.fields.get("custom"), Some(&json!("kept")));
        assert!(record.coercions.is_empty());
    }

    #[test]
    fn synced_alias_follows_canonical_value() {
        let mut record =
            normalize_record(&CHAT_SCHEMA, "g1@g.us", json!({"antilink": true})).unwrap();
        record.fields.insert("antiLink".into(), json!(false));
        record.aliases.sync(&mut record.fields);
        assert_eq!(record.fields.get("antilink"), Some(&json!(false)));
    }

    #[test]
    fn detect_only_tracks_agreeing_aliases() {
        let fields = json!({"exp": 3, "xp": 900, "money": 5, "coin": 5});
        let aliases = LegacyAliases::detect(&USER_SCHEMA, fields.as_object().unwrap());
        assert!(aliases.contains("coin"));
        assert!(!aliases.contains("xp"));
    }

    #[test]
    fn canonical_key_wins_over_alias() {
        let record = normalize_record(
            &USER_SCHEMA,
            "1@s.whatsapp.net",
            json!({"exp": 5, "xp": 900}),
        )
        .unwrap();
        assert_eq!(record.fields.get("exp"), Some(&json!(5)));
        assert_eq!(record.fields.get("xp"), Some(&json!(900)));
        assert!(record.aliases.is_empty());
    }

    #[test]
    fn pinned_canonical_key_stops_refolding() {
        let mut fields = json!({"passwordHash": "$2b$10$x"}).as_object().unwrap().clone();
        pin_canonical_keys(&PANEL_USER_SCHEMA, &mut fields);
        assert_eq!(fields.get("password"), Some(&Value::Null));

        let record = normalize_record(&PANEL_USER_SCHEMA, "ops", Value::Object(fields)).unwrap();
        assert!(!record.fields.contains_key("password"));
        assert_eq!(record.fields.get("passwordHash"), Some(&json!("$2b$10$x")));
        assert!(record.aliases.is_empty());
    }

    #[test]
    fn oversized_integer_is_clamped_with_reason() {
        let (value, reason) = coerce(Integer, json!(u64::MAX));
        assert_eq!(value, json!(i64::MAX));
        assert!(reason.unwrap().contains("clamped"));
    }

    #[test]
    fn non_object_record_is_rejected() {
        let err = normalize_record(&USER_SCHEMA, "bad", json!([1, 2])).unwrap_err();
        assert_eq!(err.field, "*");
        assert!(err.reason.contains("array"));
    }

    #[test]
    fn columns_are_key_fields_overflow() {
        let columns = PANEL_USER_SCHEMA.columns();
        assert_eq!(columns.first(), Some(&"id"));
        assert_eq!(columns.last(), Some(&"metadata"));
        assert_eq!(columns.len(), PANEL_USER_SCHEMA.fields.len() + 2);
    }
}
