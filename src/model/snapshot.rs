//! The in-memory snapshot, shaped exactly like the legacy JSON document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ValidationError;
use crate::model::fields::{normalize_record, pin_canonical_keys};
use crate::model::records::{ChatRecord, LegacyRecord, PanelUser, WhatsAppUser};

/// Collections with a fixed relational schema. Every other top-level key is
/// an extension collection.
pub const FIXED_COLLECTIONS: &[&str] = &["users", "chats", "panelUsers", "settings"];

/// Collection name → record key → record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    #[serde(default)]
    pub users: BTreeMap<String, WhatsAppUser>,
    #[serde(default)]
    pub chats: BTreeMap<String, ChatRecord>,
    #[serde(default, rename = "panelUsers")]
    pub panel_users: BTreeMap<String, PanelUser>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    /// Top-level collections outside the fixed schema, persisted one row per
    /// collection.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl DataSnapshot {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.chats.is_empty()
            && self.panel_users.is_empty()
            && self.settings.is_empty()
            && self.extensions.is_empty()
    }

    /// Total records across the fixed collections plus one per extension.
    pub fn record_count(&self) -> usize {
        self.users.len()
            + self.chats.len()
            + self.panel_users.len()
            + self.settings.len()
            + self.extensions.len()
    }

    /// Serialize to the legacy document shape, legacy aliases included.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        sync_serialized(&mut value, &self.users);
        sync_serialized(&mut value, &self.chats);
        sync_serialized(&mut value, &self.panel_users);
        Ok(value)
    }

    /// Rewrite legacy alias keys in place from their canonical fields.
    pub fn sync_aliases(&mut self) -> Result<(), serde_json::Error> {
        for user in self.users.values_mut() {
            user.sync_aliases()?;
        }
        for chat in self.chats.values_mut() {
            chat.sync_aliases()?;
        }
        for user in self.panel_users.values_mut() {
            user.sync_aliases()?;
        }
        Ok(())
    }
}

fn sync_serialized<T: LegacyRecord>(root: &mut Value, records: &BTreeMap<String, T>) {
    let Some(Value::Object(collection)) = root.get_mut(T::schema().collection) else {
        return;
    };
    for (key, record) in records {
        if let Some(Value::Object(fields)) = collection.get_mut(key) {
            record.legacy_aliases().sync(fields);
            pin_canonical_keys(T::schema(), fields);
        }
    }
}

/// Per-record validation outcome, recorded once per record with every field
/// that had to be coerced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordWarning {
    pub collection: String,
    pub key: String,
    pub fields: Vec<String>,
    pub reasons: Vec<String>,
}

/// Result of turning a raw legacy document into a typed snapshot.
#[derive(Debug, Clone, Default)]
pub struct LegacyLoad {
    pub snapshot: DataSnapshot,
    /// Records that were kept after coercion.
    pub warnings: Vec<RecordWarning>,
    /// Records (or whole collections) whose raw value could not be kept and
    /// was replaced by its default. The key itself is always kept.
    pub replaced: Vec<ValidationError>,
}

impl LegacyLoad {
    pub fn coercion_count(&self) -> usize {
        self.warnings.iter().map(|w| w.fields.len()).sum()
    }

    /// Whether building the snapshot discarded any raw legacy value.
    pub fn is_lossy(&self) -> bool {
        !self.replaced.is_empty()
    }
}

/// Validate a raw legacy document and build the snapshot.
///
/// Non-strict: invalid fields are coerced (0 / false) and logged once per
/// coercion; a record that is not an object becomes a default record under
/// the same key, and a malformed collection becomes empty.
/// Strict: the first problem of any kind is returned as the error.
pub fn load_legacy(document: Value, strict: bool) -> Result<LegacyLoad, ValidationError> {
    let mut root = match document {
        Value::Object(map) => map,
        other => {
            return Err(ValidationError {
                collection: "*".into(),
                key: "*".into(),
                field: "*".into(),
                reason: format!("document root is not an object (found {other})"),
            });
        }
    };

    let mut load = LegacyLoad::default();
    let mut snapshot = DataSnapshot::default();

    load_records(&mut root, strict, &mut load, &mut snapshot.users)?;
    for user in snapshot.users.values_mut() {
        user.sanitize();
    }
    load_records(&mut root, strict, &mut load, &mut snapshot.chats)?;
    load_records(&mut root, strict, &mut load, &mut snapshot.panel_users)?;

    if let Some(settings) = take_collection(&mut root, "settings", strict, &mut load)? {
        snapshot.settings.extend(settings);
    }

    snapshot.extensions.extend(root);
    load.snapshot = snapshot;
    Ok(load)
}

/// Remove a fixed collection from the document. A collection that is not an
/// object fails in strict mode and is emptied otherwise.
fn take_collection(
    root: &mut Map<String, Value>,
    collection: &str,
    strict: bool,
    load: &mut LegacyLoad,
) -> Result<Option<Map<String, Value>>, ValidationError> {
    match root.remove(collection) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(records)) => Ok(Some(records)),
        Some(other) => {
            let err = ValidationError {
                collection: collection.into(),
                key: "*".into(),
                field: "*".into(),
                reason: format!("collection is not an object (found {other})"),
            };
            if strict {
                return Err(err);
            }
            warn!(error = %err, "Replacing malformed collection with an empty one");
            load.replaced.push(err);
            Ok(Some(Map::new()))
        }
    }
}

/// Normalize and type every record of one fixed collection into `target`.
fn load_records<T: LegacyRecord>(
    root: &mut Map<String, Value>,
    strict: bool,
    load: &mut LegacyLoad,
    target: &mut BTreeMap<String, T>,
) -> Result<(), ValidationError> {
    let schema = T::schema();
    let Some(records) = take_collection(root, schema.collection, strict, load)? else {
        return Ok(());
    };

    for (key, value) in records {
        let normalized = match normalize_record(schema, &key, value) {
            Ok(normalized) => normalized,
            Err(err) => {
                if strict {
                    return Err(err);
                }
                target.insert(key, replace_with_default(load, err));
                continue;
            }
        };

        if !normalized.coercions.is_empty() {
            if strict {
                return Err(normalized.coercions[0].clone());
            }
            for coercion in &normalized.coercions {
                warn!(
                    collection = %coercion.collection,
                    key = %coercion.key,
                    field = %coercion.field,
                    reason = %coercion.reason,
                    "Coerced invalid legacy field"
                );
            }
            load.warnings.push(RecordWarning {
                collection: schema.collection.to_string(),
                key: key.clone(),
                fields: normalized.coercions.iter().map(|c| c.field.clone()).collect(),
                reasons: normalized.coercions.iter().map(|c| c.reason.clone()).collect(),
            });
        }

        let aliases = normalized.aliases;
        let typed = serde_json::from_value::<T>(Value::Object(normalized.fields)).and_then(
            |mut record| {
                // Mirrors take the typed form of their canonical value.
                record.set_legacy_aliases(aliases);
                record.sync_aliases()?;
                Ok(record)
            },
        );
        match typed {
            Ok(record) => {
                target.insert(key, record);
            }
            Err(err) => {
                let err = ValidationError {
                    collection: schema.collection.to_string(),
                    key: key.clone(),
                    field: "*".into(),
                    reason: format!("does not fit its type: {err}"),
                };
                if strict {
                    return Err(err);
                }
                target.insert(key, replace_with_default(load, err));
            }
        }
    }
    Ok(())
}

fn replace_with_default<T: LegacyRecord>(load: &mut LegacyLoad, err: ValidationError) -> T {
    warn!(error = %err, "Replacing invalid legacy record with defaults");
    load.warnings.push(RecordWarning {
        collection: err.collection.clone(),
        key: err.key.clone(),
        fields: vec![err.field.clone()],
        reasons: vec![err.reason.clone()],
    });
    load.replaced.push(err);
    T::default()
}
