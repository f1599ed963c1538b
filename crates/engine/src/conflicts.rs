//! Conflict store bookkeeping on top of the storage conflict tables.

use storyledger_core::{
    time, AggregateState, ConflictId, EntityId, EntityKind, ScopeId,
};
use storyledger_storage::{ConflictRecord, IncomingParent, Storage};
use tracing::{debug, warn};

use crate::{Aggregate, Engine, EngineError};

/// One conflicting entity reported back to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictSummary {
    pub kind: EntityKind,
    pub conflict_id: ConflictId,
    pub entity_id: EntityId,
    pub scope_id: ScopeId,
    pub base_version: Option<u64>,
    pub local_version: u64,
    pub local: AggregateState,
    pub incoming: AggregateState,
    pub incoming_story_id: Option<EntityId>,
}

impl ConflictSummary {
    fn new(record: &ConflictRecord, local: &Aggregate) -> Self {
        Self {
            kind: record.kind,
            conflict_id: record.conflict_id,
            entity_id: record.entity_id,
            scope_id: record.scope_id.clone(),
            base_version: record.base_version,
            local_version: local.version,
            local: local.state.clone(),
            incoming: record.incoming.clone(),
            incoming_story_id: record.incoming_parent.as_ref().map(|p| p.story_id),
        }
    }
}

impl Engine {
    /// Pending conflicts of one granularity.
    pub fn list_conflicts(&self, kind: EntityKind) -> Result<Vec<ConflictRecord>, EngineError> {
        Ok(self.storage.get_conflicts(kind)?)
    }

    pub fn conflicts_for_entity(
        &self,
        kind: EntityKind,
        entity_id: EntityId,
    ) -> Result<Vec<ConflictRecord>, EngineError> {
        Ok(self.storage.get_conflicts_for_entity(kind, entity_id)?)
    }

    pub fn conflict_count(&self, kind: EntityKind) -> Result<u64, EngineError> {
        Ok(self.storage.conflict_count(kind)?)
    }

    /// Create the entity's conflict, or refresh the incoming side and scope
    /// of the one already pending.
    ///
    /// Resubmitting the identical payload from the same scope leaves the
    /// record untouched.
    pub(crate) fn record_conflict(
        &mut self,
        local: &Aggregate,
        scope_id: &ScopeId,
        base_version: Option<u64>,
        incoming: AggregateState,
        incoming_parent: Option<IncomingParent>,
    ) -> Result<ConflictSummary, EngineError> {
        let kind = local.kind;
        let digest = incoming.digest(self.registry.get(kind)?)?;
        let now = time::now_ms()?;

        let record = match self.storage.find_conflict(kind, local.entity_id)? {
            Some(existing)
                if existing.incoming_digest == digest
                    && existing.incoming_parent == incoming_parent
                    && existing.scope_id == *scope_id =>
            {
                debug!(%kind, entity_id = %local.entity_id, scope = %scope_id, "conflict resubmitted unchanged");
                existing
            }
            Some(existing) => {
                let previous_scope = existing.scope_id.clone();
                let refreshed = ConflictRecord {
                    scope_id: scope_id.clone(),
                    base_version,
                    current_version: local.version,
                    incoming,
                    incoming_digest: digest,
                    incoming_parent,
                    updated_at: now,
                    ..existing
                };
                self.storage.refresh_conflict(&refreshed)?;
                warn!(
                    %kind,
                    entity_id = %local.entity_id,
                    scope = %scope_id,
                    %previous_scope,
                    "refreshed pending conflict"
                );
                refreshed
            }
            None => {
                let record = ConflictRecord {
                    conflict_id: ConflictId::new(),
                    kind,
                    entity_id: local.entity_id,
                    scope_id: scope_id.clone(),
                    base_version,
                    current_version: local.version,
                    original: local.state.clone(),
                    incoming,
                    incoming_digest: digest,
                    incoming_parent,
                    created_at: now,
                    updated_at: now,
                };
                self.storage.insert_conflict(&record)?;
                warn!(
                    %kind,
                    entity_id = %local.entity_id,
                    scope = %scope_id,
                    ?base_version,
                    current_version = local.version,
                    "recorded conflict"
                );
                record
            }
        };
        Ok(ConflictSummary::new(&record, local))
    }

    /// Drop the entity's pending conflict if `scope_id` set its incoming side.
    ///
    /// A conflict last refreshed by another producer still holds that
    /// producer's divergent payload and stays pending.
    pub(crate) fn clear_conflict(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
        scope_id: &ScopeId,
    ) -> Result<bool, EngineError> {
        let Some(existing) = self.storage.find_conflict(kind, entity_id)? else {
            return Ok(false);
        };
        if existing.scope_id != *scope_id {
            return Ok(false);
        }
        self.storage.delete_conflict(kind, existing.conflict_id)?;
        debug!(%kind, %entity_id, scope = %scope_id, "cleared conflict");
        Ok(true)
    }

    /// Drop item or attribute conflicts from `scope_id` for members no
    /// longer sent with `story_id`.
    pub(crate) fn clear_dropped_members(
        &mut self,
        kind: EntityKind,
        scope_id: &ScopeId,
        story_id: EntityId,
        still_sent: &[EntityId],
    ) -> Result<usize, EngineError> {
        let mut cleared = 0;
        for record in self
            .storage
            .get_member_conflicts_for_story(kind, scope_id, story_id)?
        {
            if still_sent.contains(&record.entity_id) {
                continue;
            }
            self.storage.delete_conflict(kind, record.conflict_id)?;
            debug!(
                %kind,
                entity_id = %record.entity_id,
                %story_id,
                scope = %scope_id,
                "dropped from submission, cleared its conflict"
            );
            cleared += 1;
        }
        Ok(cleared)
    }
}
