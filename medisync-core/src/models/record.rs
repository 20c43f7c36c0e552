//! Records as held by an entity store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::identity::OwnerId;
use crate::order::OrderBy;
use crate::remote::{
    merge_fields, Document, Fields, CREATED_AT_FIELD, OWNER_FIELD, UPDATED_AT_FIELD,
};

/// Prefix of ids assigned locally before the server confirms a create.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// A domain type stored in its own remote collection.
pub trait Entity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Remote collection name.
    const COLLECTION: &'static str;
    /// In-memory ordering applied to every snapshot.
    const ORDER: OrderBy;
}

/// Identifier of a record: a local temporary id until the server confirms it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordId {
    Pending(String),
    Confirmed(String),
}

impl RecordId {
    /// Generates a fresh `temp-` id.
    pub fn temporary() -> Self {
        RecordId::Pending(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple()))
    }

    /// Classifies a raw id by its prefix.
    pub fn parse(id: &str) -> Self {
        if id.starts_with(TEMP_ID_PREFIX) {
            RecordId::Pending(id.to_string())
        } else {
            RecordId::Confirmed(id.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RecordId::Pending(id) | RecordId::Confirmed(id) => id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RecordId::Pending(_))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl PartialEq<str> for RecordId {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for RecordId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Sync flags of a record. Both false means confirmed by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub sync_error: bool,
    pub is_offline: bool,
}

impl SyncStatus {
    /// Flags for a record whose last write did not reach the server.
    pub fn failed() -> Self {
        Self {
            sync_error: true,
            is_offline: true,
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.sync_error || self.is_offline
    }
}

/// A domain record plus its identity, ownership and sync state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record<E> {
    pub id: RecordId,
    /// Unknown for a record created while signed out
    pub owner_id: Option<OwnerId>,
    #[serde(flatten)]
    pub data: E,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub sync: SyncStatus,
    /// Local mutation counter; completions compare against it.
    #[serde(skip)]
    pub(crate) version: u64,
}

impl<E: Entity> Record<E> {
    /// A locally created record awaiting confirmation.
    pub fn pending(id: RecordId, owner_id: Option<OwnerId>, data: E) -> Self {
        Self {
            id,
            owner_id,
            data,
            created_at: None,
            updated_at: None,
            sync: SyncStatus::default(),
            version: 0,
        }
    }

    /// Converts a confirmed remote document.
    ///
    /// `owner_id` and the server timestamps are lifted out of the fields and
    /// the rest is deserialized as `E`.
    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        let Document { id, mut fields } = doc;

        let owner_id = fields
            .remove(OWNER_FIELD)
            .map(serde_json::from_value::<OwnerId>)
            .transpose()?
            .ok_or_else(|| serde_json::Error::missing_field(OWNER_FIELD))?;
        let created_at = fields.remove(CREATED_AT_FIELD).and_then(parse_timestamp);
        let updated_at = fields.remove(UPDATED_AT_FIELD).and_then(parse_timestamp);
        let data = serde_json::from_value(Value::Object(fields))?;

        Ok(Self {
            id: RecordId::Confirmed(id),
            owner_id: Some(owner_id),
            data,
            created_at,
            updated_at,
            sync: SyncStatus::default(),
            version: 0,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_pending()
    }

    /// Reads one domain field as JSON.
    pub fn field(&self, name: &str) -> Option<Value> {
        match serde_json::to_value(&self.data) {
            Ok(Value::Object(mut map)) => map.remove(name),
            _ => None,
        }
    }
}

fn parse_timestamp(value: Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Serializes an entity into document fields.
pub fn to_fields<E: Entity>(data: &E) -> Result<Fields, serde_json::Error> {
    match serde_json::to_value(data)? {
        Value::Object(map) => Ok(map),
        other => Err(serde_json::Error::custom(format!(
            "{} must serialize to an object, got {}",
            E::COLLECTION,
            other
        ))),
    }
}

/// Applies a partial update to an entity.
///
/// Fails when the merged fields no longer deserialize as `E`.
pub fn apply_patch<E: Entity>(data: &E, patch: Fields) -> Result<E, serde_json::Error> {
    let mut fields = to_fields(data)?;
    merge_fields(&mut fields, patch);
    serde_json::from_value(Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Patient;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_temporary_id_is_pending() {
        let id = RecordId::temporary();
        assert!(id.is_pending());
        assert!(id.as_str().starts_with(TEMP_ID_PREFIX));
        assert_ne!(RecordId::temporary(), id);
    }

    #[test]
    fn test_parse_record_id() {
        assert!(RecordId::parse("temp-abc").is_pending());
        assert_eq!(RecordId::parse("abc"), RecordId::Confirmed("abc".to_string()));
    }

    #[test]
    fn test_from_document_lifts_metadata() {
        let doc = Document::new(
            "p1",
            fields(json!({
                "owner_id": "clinic-a",
                "name": "Ada",
                "created_at": "2025-01-01T09:00:00.000Z",
                "updated_at": "2025-01-02T09:00:00.000Z",
            })),
        );
        let record: Record<Patient> = Record::from_document(doc).unwrap();
        assert_eq!(record.id, RecordId::Confirmed("p1".to_string()));
        assert_eq!(record.owner_id, Some(OwnerId::from("clinic-a")));
        assert_eq!(record.data.name, "Ada");
        assert!(record.created_at.is_some());
        assert!(record.updated_at.is_some());
        assert!(!record.sync.is_flagged());
    }

    #[test]
    fn test_from_document_requires_owner() {
        let doc = Document::new("p1", fields(json!({"name": "Ada"})));
        assert!(Record::<Patient>::from_document(doc).is_err());
    }

    #[test]
    fn test_apply_patch() {
        let patient = Patient::new("Ada");
        let patched = apply_patch(&patient, fields(json!({"phone": "555-0100"}))).unwrap();
        assert_eq!(patched.name, "Ada");
        assert_eq!(patched.phone.as_deref(), Some("555-0100"));
    }

    #[test]
    fn test_apply_patch_rejects_invalid_type() {
        let patient = Patient::new("Ada");
        assert!(apply_patch(&patient, fields(json!({"name": 42}))).is_err());
    }

    #[test]
    fn test_record_serializes_flat() {
        let record = Record::pending(
            RecordId::Pending("temp-1".to_string()),
            Some(OwnerId::from("clinic-a")),
            Patient::new("Ada"),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["name"], json!("Ada"));
        assert_eq!(value["sync_error"], json!(false));
        assert_eq!(value["id"], json!({"pending": "temp-1"}));
    }
}
