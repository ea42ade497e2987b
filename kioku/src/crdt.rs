//! Field-level convergence for entity rows.
//!
//! Each mutable row has a companion document holding one last-writer-wins
//! register per tracked field, stamped with `(logical timestamp, replica id)`,
//! plus a set-once tombstone for soft deletion. Merging two documents is
//! commutative, associative and idempotent, so replicas can exchange
//! documents in any order and converge. `sync_version` is deliberately not
//! tracked here; only the server assigns it.
//!
//! Review logs carry no document: they are immutable and merge by id union at
//! the store layer.

use crate::{Error, LibraryError, SyncErrorKind, model::EntityKind, model::SyncEntity};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Logical timestamp: wall-clock milliseconds of the writing replica plus its
/// replica id. Ties between replicas break lexicographically on the id.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Stamp {
    pub ts_ms: i64,
    pub replica_id: String,
}

impl Stamp {
    pub fn new(at: DateTime<Utc>, replica_id: &str) -> Self {
        Self {
            ts_ms: at.timestamp_millis(),
            replica_id: replica_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LwwRegister {
    pub value: Value,
    pub stamp: Stamp,
}

/// Soft-delete register. Once set on either side it stays set; when both
/// sides deleted independently, the earlier delete wins.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Tombstone {
    pub deleted_at: DateTime<Utc>,
    pub stamp: Stamp,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CrdtDocument {
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub registers: BTreeMap<String, LwwRegister>,
    pub tombstone: Option<Tombstone>,
}

/// Wire field names (serde names) whose values converge per-field. Everything
/// else on a row is either immutable after creation or server-owned.
pub fn tracked_fields(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Deck => &["name", "updatedAt"],
        EntityKind::NoteType => &[
            "name",
            "frontTemplate",
            "backTemplate",
            "isReversible",
            "updatedAt",
        ],
        EntityKind::NoteFieldType => &["name", "ord", "updatedAt"],
        EntityKind::Note => &["deckId", "noteTypeId", "updatedAt"],
        EntityKind::NoteFieldValue => &["value", "updatedAt"],
        EntityKind::Card => &[
            "front",
            "back",
            "state",
            "due",
            "stability",
            "difficulty",
            "elapsedDays",
            "scheduledDays",
            "reps",
            "lapses",
            "lastReview",
            "updatedAt",
        ],
        EntityKind::ReviewLog => &[],
    }
}

pub fn document_id(kind: EntityKind, entity_id: Uuid) -> String {
    format!("{}:{}", kind, entity_id)
}

impl CrdtDocument {
    pub fn new(entity_type: EntityKind, entity_id: Uuid) -> Self {
        Self {
            entity_type,
            entity_id,
            registers: BTreeMap::new(),
            tombstone: None,
        }
    }

    pub fn document_id(&self) -> String {
        document_id(self.entity_type, self.entity_id)
    }

    /// Builds a document from a full row, stamping every tracked field with
    /// the same stamp. Used when a row is first created.
    pub fn from_entity<T: SyncEntity>(entity: &T, stamp: &Stamp) -> Result<Self, Error> {
        let mut doc = Self::new(T::KIND, entity.id());
        let entity_value = entity_to_value(entity)?;
        doc.set_fields(&entity_value, tracked_fields(T::KIND), stamp);
        if let Some(deleted_at) = entity.deleted_at() {
            doc.set_tombstone(deleted_at, stamp);
        }
        Ok(doc)
    }

    /// Overwrites the registers of `fields` from the row's JSON value,
    /// stamping them as one local write. Fields absent from the value are
    /// skipped.
    pub fn set_fields(&mut self, entity_value: &Value, fields: &[&str], stamp: &Stamp) {
        for field in fields {
            if let Some(value) = entity_value.get(field) {
                self.registers.insert(
                    (*field).to_string(),
                    LwwRegister {
                        value: value.clone(),
                        stamp: stamp.clone(),
                    },
                );
            }
        }
    }

    pub fn set_tombstone(&mut self, deleted_at: DateTime<Utc>, stamp: &Stamp) {
        if self.tombstone.is_none() {
            self.tombstone = Some(Tombstone {
                deleted_at,
                stamp: stamp.clone(),
            });
        }
    }

    /// Commutative, associative, idempotent merge. Per field the register
    /// with the greater `(ts_ms, replica_id)` stamp wins; tombstones are
    /// kept once set, preferring the earlier delete.
    pub fn merge(&self, other: &Self) -> Self {
        let mut registers = self.registers.clone();
        for (field, theirs) in &other.registers {
            match registers.get(field) {
                Some(ours) if ours.stamp >= theirs.stamp => {}
                _ => {
                    registers.insert(field.clone(), theirs.clone());
                }
            }
        }
        let tombstone = match (&self.tombstone, &other.tombstone) {
            (Some(a), Some(b)) => Some(if a.stamp <= b.stamp { a } else { b }.clone()),
            (Some(a), None) => Some(a.clone()),
            (None, b) => b.clone(),
        };
        Self {
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            registers,
            tombstone,
        }
    }

    /// Writes the register values over a row's JSON value. The tombstone, if
    /// any, sets `deletedAt`; a document without a tombstone leaves the
    /// row's `deletedAt` untouched.
    pub fn materialize_onto(&self, entity_value: &mut Value) {
        let Some(object) = entity_value.as_object_mut() else {
            return;
        };
        for (field, register) in &self.registers {
            object.insert(field.clone(), register.value.clone());
        }
        if let Some(tombstone) = &self.tombstone {
            object.insert(
                "deletedAt".to_string(),
                serde_json::to_value(tombstone.deleted_at).unwrap_or(Value::Null),
            );
        }
    }

    /// Applies this document to a typed row.
    pub fn materialize<T: SyncEntity>(&self, base: &T) -> Result<T, Error> {
        let mut value = entity_to_value(base)?;
        self.materialize_onto(&mut value);
        serde_json::from_value(value).map_err(|e| {
            Error::Library(LibraryError::Sync(SyncErrorKind::BadDocument(
                e.to_string(),
            )))
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::Library(LibraryError::Sync(SyncErrorKind::BadDocument(
                e.to_string(),
            )))
        })
    }

    pub fn encode_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn decode_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = BASE64.decode(encoded).map_err(|e| {
            Error::Library(LibraryError::Sync(SyncErrorKind::BadDocument(
                e.to_string(),
            )))
        })?;
        Self::from_bytes(&bytes)
    }
}

pub fn entity_to_value<T: SyncEntity>(entity: &T) -> Result<Value, Error> {
    serde_json::to_value(entity).map_err(|e| {
        Error::Library(LibraryError::Sync(SyncErrorKind::BadDocument(
            e.to_string(),
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Deck;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stamp(ts_ms: i64, replica: &str) -> Stamp {
        Stamp {
            ts_ms,
            replica_id: replica.to_string(),
        }
    }

    fn doc_with(fields: &[(&str, Value, Stamp)]) -> CrdtDocument {
        let mut doc = CrdtDocument::new(EntityKind::Deck, Uuid::nil());
        for (field, value, stamp) in fields {
            doc.registers.insert(
                (*field).to_string(),
                LwwRegister {
                    value: value.clone(),
                    stamp: stamp.clone(),
                },
            );
        }
        doc
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = doc_with(&[
            ("name", json!("A"), stamp(100, "r1")),
            ("updatedAt", json!("2025-01-01T00:00:00Z"), stamp(100, "r1")),
        ]);
        let b = doc_with(&[
            ("name", json!("B"), stamp(101, "r2")),
            ("updatedAt", json!("2025-01-02T00:00:00Z"), stamp(101, "r2")),
        ]);
        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&b).registers["name"].value, json!("B"));
    }

    #[test]
    fn test_merge_is_associative() {
        let a = doc_with(&[("name", json!("A"), stamp(100, "r1"))]);
        let b = doc_with(&[("name", json!("B"), stamp(200, "r2"))]);
        let c = doc_with(&[("name", json!("C"), stamp(150, "r3"))]);
        assert_eq!(a.merge(&b.merge(&c)), a.merge(&b).merge(&c));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = doc_with(&[("name", json!("A"), stamp(100, "r1"))]);
        assert_eq!(a.merge(&a), a);
    }

    #[test]
    fn test_equal_timestamps_break_ties_on_replica_id() {
        let a = doc_with(&[("name", json!("A"), stamp(100, "r1"))]);
        let b = doc_with(&[("name", json!("B"), stamp(100, "r2"))]);
        let merged = a.merge(&b);
        assert_eq!(merged.registers["name"].value, json!("B"));
        assert_eq!(merged, b.merge(&a));
    }

    #[test]
    fn test_tombstone_stays_set_and_prefers_earlier_delete() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(30);
        let mut a = doc_with(&[]);
        a.set_tombstone(t2, &stamp(200, "r1"));
        let b = doc_with(&[]);
        let merged = a.merge(&b);
        assert_eq!(merged.tombstone.as_ref().unwrap().deleted_at, t2);

        let mut c = doc_with(&[]);
        c.set_tombstone(t1, &stamp(100, "r2"));
        let merged = a.merge(&c);
        assert_eq!(merged.tombstone.as_ref().unwrap().deleted_at, t1);
        assert_eq!(merged, c.merge(&a));
    }

    #[test]
    fn test_bytes_round_trip() {
        let a = doc_with(&[("name", json!("Japanese"), stamp(123, "r1"))]);
        let restored = CrdtDocument::from_bytes(&a.to_bytes()).unwrap();
        assert_eq!(a, restored);
        let restored = CrdtDocument::decode_base64(&a.encode_base64()).unwrap();
        assert_eq!(a, restored);
    }

    #[test]
    fn test_entity_round_trip_preserves_tracked_fields() {
        let now = Utc::now();
        let deck = Deck {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Japanese".to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            sync_version: 4,
        };
        let doc = CrdtDocument::from_entity(&deck, &stamp(500, "r1")).unwrap();
        assert_eq!(doc.document_id(), format!("deck:{}", deck.id));

        let mut renamed = doc.clone();
        renamed.set_fields(
            &json!({"name": "Nihongo"}),
            tracked_fields(EntityKind::Deck),
            &stamp(600, "r2"),
        );
        let materialized = renamed.merge(&doc).materialize(&deck).unwrap();
        assert_eq!(materialized.name, "Nihongo");
        // Server-owned fields pass through untouched.
        assert_eq!(materialized.sync_version, 4);
        assert_eq!(materialized.created_at, deck.created_at);
    }

    #[test]
    fn test_materialize_applies_tombstone() {
        let now = Utc::now();
        let deck = Deck {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Japanese".to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            sync_version: 0,
        };
        let mut doc = CrdtDocument::from_entity(&deck, &stamp(1, "r1")).unwrap();
        doc.set_tombstone(now, &stamp(2, "r1"));
        let materialized = doc.materialize(&deck).unwrap();
        assert_eq!(materialized.deleted_at, Some(now));
    }
}
