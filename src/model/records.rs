//! Typed records, serialized with exactly the legacy JSON keys.
//!
//! Keys must agree with the field mapping tables in `fields.rs`; anything not
//! mapped is preserved in the flattened `extra`/`metadata` bag.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::fields::{
    CHAT_SCHEMA, LegacyAliases, PANEL_USER_SCHEMA, RecordSchema, USER_SCHEMA,
};

/// A record type described by one field mapping table.
pub trait LegacyRecord: Serialize + DeserializeOwned + Default {
    fn schema() -> &'static RecordSchema;

    fn legacy_aliases(&self) -> &LegacyAliases;

    fn set_legacy_aliases(&mut self, aliases: LegacyAliases);

    /// Unmapped keys, flattened into the record on serialization.
    fn overflow_mut(&mut self) -> &mut Map<String, Value>;

    /// Rewrite every tracked legacy alias from its canonical field.
    fn sync_aliases(&mut self) -> Result<(), serde_json::Error> {
        if self.legacy_aliases().is_empty() {
            return Ok(());
        }
        let mut fields = match serde_json::to_value(&*self)? {
            Value::Object(fields) => fields,
            _ => return Ok(()),
        };
        self.legacy_aliases().sync(&mut fields);
        let names: Vec<&'static str> = self.legacy_aliases().names().collect();
        let overflow = self.overflow_mut();
        for name in names {
            if let Some(value) = fields.remove(name) {
                overflow.insert(name.to_string(), value);
            }
        }
        Ok(())
    }
}

/// A WhatsApp user profile, keyed by JID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    // Stats
    #[serde(default)]
    pub exp: f64,
    #[serde(default)]
    pub money: f64,
    #[serde(default)]
    pub limit: f64,
    #[serde(default)]
    pub level: i64,
    #[serde(default)]
    pub health: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    // Settings
    #[serde(default)]
    pub premium: bool,
    #[serde(default)]
    pub premium_time: i64,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub warn: i64,

    // Activity
    #[serde(default)]
    pub command_count: i64,
    /// Epoch millis the user went away, `-1` when present.
    #[serde(default = "not_away")]
    pub afk: i64,
    #[serde(default)]
    pub afk_reason: String,
    #[serde(default)]
    pub registered: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip)]
    pub legacy_aliases: LegacyAliases,
}

fn not_away() -> i64 {
    -1
}

impl Default for WhatsAppUser {
    fn default() -> Self {
        Self {
            name: None,
            exp: 0.0,
            money: 0.0,
            limit: 0.0,
            level: 0,
            health: 0.0,
            role: None,
            premium: false,
            premium_time: 0,
            banned: false,
            warn: 0,
            command_count: 0,
            afk: not_away(),
            afk_reason: String::new(),
            registered: false,
            extra: Map::new(),
            legacy_aliases: LegacyAliases::default(),
        }
    }
}

impl WhatsAppUser {
    pub fn is_away(&self) -> bool {
        self.afk >= 0
    }

    /// Replace any non-finite stat with 0.
    pub fn sanitize(&mut self) {
        for stat in [&mut self.exp, &mut self.money, &mut self.limit, &mut self.health] {
            if !stat.is_finite() {
                *stat = 0.0;
            }
        }
    }
}

/// Per-chat settings and message templates, keyed by JID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(default)]
    pub is_banned: bool,
    #[serde(default)]
    pub welcome: bool,
    #[serde(default)]
    pub detect: bool,
    #[serde(default)]
    pub anti_link: bool,
    #[serde(default)]
    pub anti_delete: bool,
    #[serde(default)]
    pub only_admin: bool,
    #[serde(default)]
    pub nsfw: bool,

    // Templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s_welcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s_bye: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s_promote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s_demote: Option<String>,

    /// Epoch millis the bot's rental in this chat expires, 0 for never.
    #[serde(default)]
    pub expired: i64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip)]
    pub legacy_aliases: LegacyAliases,
}

/// An administration-panel account, keyed by username or id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password hash. Never plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "enabled")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<Value>,

    /// Everything outside the fixed columns.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
    #[serde(skip)]
    pub legacy_aliases: LegacyAliases,
}

fn enabled() -> bool {
    true
}

impl Default for PanelUser {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            role: None,
            email: None,
            active: enabled(),
            created_at: None,
            last_login: None,
            metadata: Map::new(),
            legacy_aliases: LegacyAliases::default(),
        }
    }
}

impl LegacyRecord for WhatsAppUser {
    fn schema() -> &'static RecordSchema {
        &USER_SCHEMA
    }

    fn legacy_aliases(&self) -> &LegacyAliases {
        &self.legacy_aliases
    }

    fn set_legacy_aliases(&mut self, aliases: LegacyAliases) {
        self.legacy_aliases = aliases;
    }

    fn overflow_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.extra
    }
}

impl LegacyRecord for ChatRecord {
    fn schema() -> &'static RecordSchema {
        &CHAT_SCHEMA
    }

    fn legacy_aliases(&self) -> &LegacyAliases {
        &self.legacy_aliases
    }

    fn set_legacy_aliases(&mut self, aliases: LegacyAliases) {
        self.legacy_aliases = aliases;
    }

    fn overflow_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.extra
    }
}

impl LegacyRecord for PanelUser {
    fn schema() -> &'static RecordSchema {
        &PANEL_USER_SCHEMA
    }

    fn legacy_aliases(&self) -> &LegacyAliases {
        &self.legacy_aliases
    }

    fn set_legacy_aliases(&mut self, aliases: LegacyAliases) {
        self.legacy_aliases = aliases;
    }

    fn overflow_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.metadata
    }
}
