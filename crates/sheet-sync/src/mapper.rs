//! Translation between local sheets and remote records.

use crate::fields::{FieldKey, FieldMask};
use crate::model::{ColumnSpec, Sheet};
use crate::remote::{FieldValue, RecordId, RecordMetadata, RemoteError, RemoteRecord, ZoneId};
use thiserror::Error;
use uuid::Uuid;

/// Remote record type of a sheet.
pub const RECORD_TYPE: &str = "Sheet";

/// Namespace for deterministic record names. Changing it forks every
/// device's notion of which remote record belongs to which sheet.
const RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b0e_93d4_5a7e_8c21_4d5e_0b7a_19f3);

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("Field {0} has the wrong type")]
    WrongType(FieldKey),

    #[error("Cannot encode columns: {0}")]
    Columns(String),

    #[error("Corrupt remote metadata: {0}")]
    Metadata(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, MapperError>;

#[derive(Debug, Clone)]
pub struct RecordMapper {
    zone: ZoneId,
}

impl RecordMapper {
    pub fn new(zone: ZoneId) -> Self {
        Self { zone }
    }

    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    /// Deterministic record name for a natural key.
    ///
    /// Two devices creating a sheet with the same key compute the same name,
    /// so a retried or duplicated insert can never create a second record.
    pub fn record_name_for_key(key: &str) -> String {
        format!("sheet-{}", Uuid::new_v5(&RECORD_NAMESPACE, key.as_bytes()))
    }

    /// Remote identity of a sheet: the stored one, or the one it will get.
    pub fn record_id(&self, sheet: &Sheet) -> RecordId {
        let name = sheet
            .remote_name
            .clone()
            .unwrap_or_else(|| Self::record_name_for_key(&sheet.key));
        RecordId::new(self.zone.clone(), name)
    }

    /// Wire value of one field.
    pub fn field_value(sheet: &Sheet, key: FieldKey) -> Result<FieldValue> {
        Ok(match key {
            FieldKey::Key => FieldValue::String(sheet.key.clone()),
            FieldKey::Name => FieldValue::String(sheet.name.clone()),
            FieldKey::Notes => FieldValue::String(sheet.notes.clone()),
            FieldKey::SortOrder => FieldValue::Int(sheet.sort_order),
            FieldKey::Columns => FieldValue::Bytes(
                serde_json::to_vec(&sheet.columns).map_err(|e| MapperError::Columns(e.to_string()))?,
            ),
            FieldKey::CreatedAt => FieldValue::Timestamp(sheet.created_at),
            FieldKey::ModifiedAt => FieldValue::Timestamp(sheet.modified_at),
        })
    }

    /// Serialize exactly `fields` of `sheet`, plus its last known metadata.
    pub fn to_remote_record(&self, sheet: &Sheet, fields: FieldMask) -> Result<RemoteRecord> {
        let mut record = RemoteRecord::new(self.record_id(sheet), RECORD_TYPE);
        for key in fields.iter() {
            record
                .fields
                .insert(key.name().to_string(), Self::field_value(sheet, key)?);
        }
        record.metadata = match &sheet.remote_metadata {
            Some(bytes) => Some(RecordMetadata::decode(bytes)?),
            None => None,
        };
        Ok(record)
    }

    /// Copy remote field values onto `sheet`, leaving `skipping` untouched.
    ///
    /// Fields the record does not carry keep their local value.
    pub fn apply_remote_record(
        remote: &RemoteRecord,
        sheet: &mut Sheet,
        skipping: FieldMask,
    ) -> Result<()> {
        for key in FieldKey::ALL.iter().copied() {
            if skipping.contains(key) {
                continue;
            }
            let Some(value) = remote.fields.get(key.name()) else {
                continue;
            };
            match (key, value) {
                (FieldKey::Key, FieldValue::String(s)) => sheet.key = s.clone(),
                (FieldKey::Name, FieldValue::String(s)) => sheet.name = s.clone(),
                (FieldKey::Notes, FieldValue::String(s)) => sheet.notes = s.clone(),
                (FieldKey::SortOrder, FieldValue::Int(n)) => sheet.sort_order = *n,
                (FieldKey::Columns, FieldValue::Bytes(bytes)) => {
                    sheet.columns = serde_json::from_slice::<Vec<ColumnSpec>>(bytes)
                        .map_err(|e| MapperError::Columns(e.to_string()))?;
                }
                (FieldKey::CreatedAt, FieldValue::Timestamp(t)) => sheet.created_at = *t,
                (FieldKey::ModifiedAt, FieldValue::Timestamp(t)) => sheet.modified_at = *t,
                (key, _) => return Err(MapperError::WrongType(key)),
            }
        }
        Ok(())
    }

    /// Encoded metadata of a record returned by the server.
    pub fn metadata_bytes(remote: &RemoteRecord) -> Result<Option<Vec<u8>>> {
        match &remote.metadata {
            Some(metadata) => Ok(Some(metadata.encode()?)),
            None => Ok(None),
        }
    }

    /// Scalar fields among `among` whose server value differs from `sheet`.
    ///
    /// Blob fields are never compared.
    pub fn diverged_fields(
        remote: &RemoteRecord,
        sheet: &Sheet,
        among: FieldMask,
    ) -> Result<FieldMask> {
        let mut diverged = FieldMask::empty();
        for key in among.iter().filter(|key| key.is_scalar()) {
            if remote.fields.get(key.name()) != Some(&Self::field_value(sheet, key)?) {
                diverged.insert(key);
            }
        }
        Ok(diverged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnKind, NewSheet, ObjectId};

    fn mapper() -> RecordMapper {
        RecordMapper::new(ZoneId::new("Sheets", "__defaultOwner__"))
    }

    fn sample() -> Sheet {
        let mut draft = NewSheet::named("Reading List");
        draft.notes = "2025".into();
        draft.sort_order = 3;
        draft.columns = vec![
            ColumnSpec::text("Title"),
            ColumnSpec {
                title: "Status".into(),
                kind: ColumnKind::Choice {
                    options: vec!["todo".into(), "done".into()],
                },
            },
        ];
        Sheet::from_draft(ObjectId::new(1), draft)
    }

    #[test]
    fn test_record_name_is_deterministic() {
        let a = RecordMapper::record_name_for_key("reading-list");
        let b = RecordMapper::record_name_for_key("reading-list");
        assert_eq!(a, b);
        assert!(a.starts_with("sheet-"));
        assert_ne!(a, RecordMapper::record_name_for_key("groceries"));
    }

    #[test]
    fn test_roundtrip_all_fields() {
        let local = sample();
        let record = mapper().to_remote_record(&local, FieldMask::all()).unwrap();

        let mut copy = Sheet::blank(local.id);
        RecordMapper::apply_remote_record(&record, &mut copy, FieldMask::empty()).unwrap();

        assert_eq!(copy.key, local.key);
        assert_eq!(copy.name, local.name);
        assert_eq!(copy.notes, local.notes);
        assert_eq!(copy.sort_order, local.sort_order);
        assert_eq!(copy.columns, local.columns);
        assert_eq!(copy.created_at, local.created_at);
        assert_eq!(copy.modified_at, local.modified_at);
    }

    #[test]
    fn test_delta_contains_only_requested_fields() {
        let record = mapper()
            .to_remote_record(&sample(), FieldMask::from(FieldKey::Notes))
            .unwrap();
        assert_eq!(record.fields.len(), 1);
        assert_eq!(
            record.fields.get("notes"),
            Some(&FieldValue::String("2025".into()))
        );
    }

    #[test]
    fn test_apply_skips_dirty_fields() {
        let mut local = sample();
        let mut remote = mapper().to_remote_record(&local, FieldMask::all()).unwrap();
        remote
            .fields
            .insert("name".into(), FieldValue::String("Theirs".into()));
        remote
            .fields
            .insert("notes".into(), FieldValue::String("Their notes".into()));

        local.name = "Mine".into();
        RecordMapper::apply_remote_record(&remote, &mut local, FieldMask::from(FieldKey::Name))
            .unwrap();

        assert_eq!(local.name, "Mine");
        assert_eq!(local.notes, "Their notes");
    }

    #[test]
    fn test_wrong_type_is_an_error() {
        let mut remote = mapper().to_remote_record(&sample(), FieldMask::empty()).unwrap();
        remote.fields.insert("sortOrder".into(), FieldValue::String("x".into()));
        let mut local = sample();
        assert!(matches!(
            RecordMapper::apply_remote_record(&remote, &mut local, FieldMask::empty()),
            Err(MapperError::WrongType(FieldKey::SortOrder))
        ));
    }

    #[test]
    fn test_diverged_ignores_blobs() {
        let local = sample();
        let mut remote = mapper().to_remote_record(&local, FieldMask::all()).unwrap();
        remote
            .fields
            .insert("name".into(), FieldValue::String("READING LIST".into()));
        remote.fields.insert("columns".into(), FieldValue::Bytes(vec![]));

        let diverged =
            RecordMapper::diverged_fields(&remote, &local, FieldMask::all()).unwrap();
        assert_eq!(diverged, FieldMask::from(FieldKey::Name));
    }

    #[test]
    fn test_metadata_travels_with_record() {
        let mut local = sample();
        let metadata = RecordMetadata {
            change_tag: 9,
            modified_at: 1,
        };
        local.set_remote_identity("sheet-x".into(), metadata.encode().unwrap());

        let record = mapper().to_remote_record(&local, FieldMask::empty()).unwrap();
        assert_eq!(record.id.name, "sheet-x");
        assert_eq!(record.metadata, Some(metadata));
    }
}
