//! Snapshot data model: typed records and their field mapping tables.

pub mod fields;
pub mod records;
pub mod snapshot;

pub use fields::{FieldKind, FieldSpec, LegacyAliases, RecordSchema};
pub use records::{ChatRecord, LegacyRecord, PanelUser, WhatsAppUser};
pub use snapshot::{DataSnapshot, LegacyLoad, RecordWarning, load_legacy};
