//! Material-change detection between two states of one aggregate.

use std::collections::BTreeSet;

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::ids::EntityId;
use crate::registry::TypeDescriptor;
use crate::state::{AggregateState, ChangeKind};

static NULL: FieldValue = FieldValue::Null;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDiff {
    pub relation: &'static str,
    pub added: Vec<EntityId>,
    pub removed: Vec<EntityId>,
    /// Same members in a different order on an order-significant relation.
    pub reordered: bool,
}

impl RelationDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && !self.reordered
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub kind: ChangeKind,
    pub changed_fields: Vec<String>,
    pub relations: Vec<RelationDiff>,
}

impl ChangeSet {
    pub fn is_material(&self) -> bool {
        self.kind != ChangeKind::NoOp
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDiff> {
        self.relations.iter().find(|d| d.relation == name)
    }
}

pub struct ChangeDetector<'a> {
    descriptor: &'a TypeDescriptor,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(descriptor: &'a TypeDescriptor) -> Self {
        Self { descriptor }
    }

    /// Classify the transition from `previous` to `proposed`.
    ///
    /// `None` on either side means the aggregate does not exist (or is
    /// deleted) on that side. Must be called on the final proposed state of a
    /// logical operation, once.
    pub fn classify(
        &self,
        previous: Option<&AggregateState>,
        proposed: Option<&AggregateState>,
    ) -> Result<ChangeSet, CoreError> {
        let empty = AggregateState::default();
        let (before, after) = match (previous, proposed) {
            (None, None) => {
                return Ok(ChangeSet {
                    kind: ChangeKind::NoOp,
                    changed_fields: Vec::new(),
                    relations: Vec::new(),
                });
            }
            (p, n) => (p.unwrap_or(&empty), n.unwrap_or(&empty)),
        };

        let changed_fields = self.changed_fields(before, after)?;
        let relations: Vec<RelationDiff> = self
            .descriptor
            .relations
            .iter()
            .map(|spec| {
                diff_members(
                    spec.name,
                    spec.ordered,
                    before.members(spec.name),
                    after.members(spec.name),
                )
            })
            .filter(|d| !d.is_empty())
            .collect();

        let kind = match (previous, proposed) {
            (None, Some(_)) => ChangeKind::Created,
            (Some(_), None) => ChangeKind::Deleted,
            _ if !changed_fields.is_empty() => ChangeKind::FieldChange,
            _ if !relations.is_empty() => ChangeKind::RelationChange,
            _ => ChangeKind::NoOp,
        };

        Ok(ChangeSet {
            kind,
            changed_fields,
            relations,
        })
    }

    fn changed_fields(
        &self,
        before: &AggregateState,
        after: &AggregateState,
    ) -> Result<Vec<String>, CoreError> {
        let keys: BTreeSet<&String> = before.fields.keys().chain(after.fields.keys()).collect();
        let mut changed = Vec::new();
        for key in keys {
            let old = before.fields.get(key).unwrap_or(&NULL);
            let new = after.fields.get(key).unwrap_or(&NULL);
            if serialized(old)? != serialized(new)? {
                changed.push(key.clone());
            }
        }
        Ok(changed)
    }
}

fn serialized(value: &FieldValue) -> Result<Vec<u8>, CoreError> {
    value
        .to_msgpack()
        .map_err(|e| CoreError::Serialization(e.to_string()))
}

fn diff_members(
    relation: &'static str,
    ordered: bool,
    before: &[EntityId],
    after: &[EntityId],
) -> RelationDiff {
    let before_set: BTreeSet<EntityId> = before.iter().copied().collect();
    let after_set: BTreeSet<EntityId> = after.iter().copied().collect();

    let mut seen = BTreeSet::new();
    let added = after
        .iter()
        .filter(|id| !before_set.contains(*id) && seen.insert(**id))
        .copied()
        .collect();
    let mut seen = BTreeSet::new();
    let removed = before
        .iter()
        .filter(|id| !after_set.contains(*id) && seen.insert(**id))
        .copied()
        .collect();
    let reordered = ordered && before_set == after_set && before != after;

    RelationDiff {
        relation,
        added,
        removed,
        reordered,
    }
}
