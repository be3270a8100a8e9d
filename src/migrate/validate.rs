//! Step 2: validate and coerce the legacy document.

use serde_json::Value;
use tracing::info;

use crate::error::MigrationError;
use crate::model::{LegacyLoad, load_legacy};

/// Coerce invalid fields (non-strict) or refuse the document (strict).
pub fn validate(document: Value, strict: bool) -> Result<LegacyLoad, MigrationError> {
    let load = load_legacy(document, strict)?;
    info!(
        records = load.snapshot.record_count(),
        coerced_records = load.warnings.len(),
        coercions = load.coercion_count(),
        replaced = load.replaced.len(),
        strict,
        "Validated legacy snapshot"
    );
    Ok(load)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_finite_numbers_default_to_zero() {
        let document = json!({
            "users": {
                "a@s.whatsapp.net": {"exp": "Infinity", "money": null, "level": "NaN"},
                "b@s.whatsapp.net": {"health": {"max": 100}}
            }
        });
        let load = validate(document, false).unwrap();
        let a = &load.snapshot.users["a@s.whatsapp.net"];
        assert_eq!((a.exp, a.money, a.level), (0.0, 0.0, 0));
        assert_eq!(load.snapshot.users["b@s.whatsapp.net"].health, 0.0);
        assert_eq!(load.warnings.len(), 2);
    }

    #[test]
    fn strict_mode_refuses() {
        let err = validate(json!({"chats": {"g@g.us": {"welcome": "on"}}}), true).unwrap_err();
        assert!(matches!(err, MigrationError::Validation(ref v) if v.field == "welcome"));
    }
}
