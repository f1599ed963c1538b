use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::ids::{ActorId, ConflictId, EntityId, ScopeId, SnapshotDigest};
use crate::registry::{EntityKind, TypeDescriptor};

/// Field values and relation memberships of one aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateState {
    pub fields: BTreeMap<String, FieldValue>,
    pub relations: BTreeMap<String, Vec<EntityId>>,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn with_members(mut self, relation: &str, members: Vec<EntityId>) -> Self {
        self.relations.insert(relation.to_string(), members);
        self
    }

    pub fn set_field(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn members(&self, relation: &str) -> &[EntityId] {
        self.relations.get(relation).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// The state as the change detector sees it: nulls dropped, empty
    /// relations dropped, unordered relations sorted and deduplicated.
    pub fn normalized(&self, descriptor: &TypeDescriptor) -> Self {
        let fields = self
            .fields
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let relations = self
            .relations
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(name, members)| {
                let ordered = descriptor.relation(name).is_some_and(|r| r.ordered);
                let mut members = members.clone();
                if !ordered {
                    members.sort();
                    members.dedup();
                }
                (name.clone(), members)
            })
            .collect();
        Self { fields, relations }
    }

    /// Digest of the normalized state, so two states the change detector
    /// considers equal hash the same.
    pub fn digest(&self, descriptor: &TypeDescriptor) -> Result<SnapshotDigest, CoreError> {
        Ok(SnapshotDigest::of(&self.normalized(descriptor).to_msgpack()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    NoOp,
    FieldChange,
    RelationChange,
    Created,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::FieldChange => "field_change",
            Self::RelationChange => "relation_change",
            Self::Created => "created",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "noop" => Ok(Self::NoOp),
            "field_change" => Ok(Self::FieldChange),
            "relation_change" => Ok(Self::RelationChange),
            "created" => Ok(Self::Created),
            "deleted" => Ok(Self::Deleted),
            _ => Err(CoreError::Serialization(format!("unknown change kind: {s}"))),
        }
    }
}

/// A relation member together with its version when the snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub entity_id: EntityId,
    pub version: Option<u64>,
}

/// One immutable recorded state of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub version: u64,
    pub changed_at: i64,
    pub changed_by: ActorId,
    pub origin: ChangeOrigin,
    pub change: ChangeKind,
    pub fields: BTreeMap<String, FieldValue>,
    pub relations: BTreeMap<String, Vec<MemberRef>>,
}

impl HistorySnapshot {
    /// The aggregate state this snapshot records, without member versions.
    pub fn state(&self) -> AggregateState {
        AggregateState {
            fields: self.fields.clone(),
            relations: self
                .relations
                .iter()
                .map(|(name, members)| {
                    (name.clone(), members.iter().map(|m| m.entity_id).collect())
                })
                .collect(),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Where a change came from. Recorded on every history snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Interactive edit, bulk import or bot merge: always committed.
    Local,
    /// Worker/connector submission, checked against its declared base.
    External(ScopeId),
    /// Human decision on a pending conflict.
    Resolution(ConflictId),
}

/// Attribution passed explicitly into every commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeContext {
    pub actor: ActorId,
    pub origin: ChangeOrigin,
}

impl ChangeContext {
    pub fn local(actor: impl Into<String>) -> Self {
        Self {
            actor: ActorId::new(actor),
            origin: ChangeOrigin::Local,
        }
    }

    pub fn external(actor: impl Into<String>, scope: ScopeId) -> Self {
        Self {
            actor: ActorId::new(actor),
            origin: ChangeOrigin::External(scope),
        }
    }

    pub fn resolution(actor: ActorId, conflict_id: ConflictId) -> Self {
        Self {
            actor,
            origin: ChangeOrigin::Resolution(conflict_id),
        }
    }
}
