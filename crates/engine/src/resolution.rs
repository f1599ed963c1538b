//! Human resolution of pending conflicts.

use std::collections::BTreeMap;

use storyledger_core::{ActorId, ChangeContext, EntityId, EntityKind, FieldValue};
use storyledger_storage::Storage;
use tracing::info;

use crate::{Aggregate, CommitOutcome, Engine, EngineError};

/// Final values chosen by a human. Fields not named keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub fields: BTreeMap<String, FieldValue>,
    /// Relations to replace wholesale.
    pub relations: BTreeMap<String, Vec<EntityId>>,
}

impl Resolution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub aggregate: Aggregate,
    pub outcome: CommitOutcome,
    /// Conflict records removed for the entity.
    pub cleared: usize,
}

impl Engine {
    pub fn resolve_story_conflict(
        &mut self,
        story_id: EntityId,
        resolution: &Resolution,
        actor: ActorId,
    ) -> Result<ResolvedEntity, EngineError> {
        self.resolve(EntityKind::Story, story_id, resolution, actor)
    }

    pub fn resolve_news_item_conflict(
        &mut self,
        news_item_id: EntityId,
        resolution: &Resolution,
        actor: ActorId,
    ) -> Result<ResolvedEntity, EngineError> {
        self.resolve(EntityKind::NewsItem, news_item_id, resolution, actor)
    }

    pub fn resolve_attribute_conflict(
        &mut self,
        attribute_id: EntityId,
        resolution: &Resolution,
        actor: ActorId,
    ) -> Result<ResolvedEntity, EngineError> {
        self.resolve(EntityKind::Attribute, attribute_id, resolution, actor)
    }

    /// Apply `resolution` as a local edit, then delete the entity's conflict.
    fn resolve(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
        resolution: &Resolution,
        actor: ActorId,
    ) -> Result<ResolvedEntity, EngineError> {
        self.transaction(|engine| {
            let Some(pending) = engine.storage.find_conflict(kind, entity_id)? else {
                return Err(EngineError::ConflictNotFound(format!("{kind} {entity_id}")));
            };

            let mut state = engine.require_live(kind, entity_id)?.state;
            for (name, value) in &resolution.fields {
                state.fields.insert(name.clone(), value.clone());
            }
            for (name, members) in &resolution.relations {
                state.relations.insert(name.clone(), members.clone());
            }

            let ctx = ChangeContext::resolution(actor, pending.conflict_id);
            let outcome = engine.apply_change(kind, entity_id, Some(state), &ctx)?;
            let cleared = engine.storage.delete_conflicts_for_entity(kind, entity_id)?;
            let aggregate = engine.require_live(kind, entity_id)?;
            info!(
                %kind,
                %entity_id,
                version = aggregate.version,
                cleared,
                conflict_id = %pending.conflict_id,
                actor = %ctx.actor,
                "resolved conflict"
            );
            Ok(ResolvedEntity {
                aggregate,
                outcome,
                cleared,
            })
        })
    }
}
