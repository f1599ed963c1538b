use storyledger_core::{
    registry::{JoinSpec, TypeDescriptor},
    ActorId, AggregateState, ConflictId, EntityId, EntityKind, HistorySnapshot,
    ScopeId, SnapshotDigest,
};

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted: bool,
}

/// One history row of a versioned join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRecord {
    pub owner_id: EntityId,
    pub member_id: EntityId,
    pub version: u64,
    /// Owner's version when the link was made or removed.
    pub owner_version: u64,
    /// Member's version when the link was made or removed.
    pub member_version: u64,
    pub linked: bool,
    pub changed_at: i64,
    pub changed_by: ActorId,
}

/// The story bundle an item or attribute conflict arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingParent {
    pub story_id: EntityId,
    pub story: AggregateState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub conflict_id: ConflictId,
    pub kind: EntityKind,
    pub entity_id: EntityId,
    /// Producer whose submission last set `incoming`.
    pub scope_id: ScopeId,
    pub base_version: Option<u64>,
    pub current_version: u64,
    /// Stored state when the conflict was first detected. Never refreshed.
    pub original: AggregateState,
    /// Latest submitted state, from any scope.
    pub incoming: AggregateState,
    pub incoming_digest: SnapshotDigest,
    /// Set for item and attribute conflicts.
    pub incoming_parent: Option<IncomingParent>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub trait Storage {
    // Aggregates

    fn get_entity(&self, entity_id: EntityId) -> Result<Option<EntityRecord>, StorageError>;

    fn get_entities_by_kind(&self, kind: EntityKind) -> Result<Vec<EntityId>, StorageError>;

    fn insert_entity(
        &mut self,
        entity_id: EntityId,
        kind: EntityKind,
        now: i64,
    ) -> Result<(), StorageError>;

    fn set_entity_version(
        &mut self,
        entity_id: EntityId,
        version: u64,
        now: i64,
    ) -> Result<(), StorageError>;

    fn mark_deleted(&mut self, entity_id: EntityId, now: i64) -> Result<(), StorageError>;

    fn load_state(
        &self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
    ) -> Result<AggregateState, StorageError>;

    fn replace_fields(
        &mut self,
        entity_id: EntityId,
        state: &AggregateState,
    ) -> Result<(), StorageError>;

    fn replace_members(
        &mut self,
        entity_id: EntityId,
        relation: &str,
        members: &[EntityId],
    ) -> Result<(), StorageError>;

    /// Owners that currently list `member_id` under `relation`.
    fn get_owners(&self, member_id: EntityId, relation: &str) -> Result<Vec<EntityId>, StorageError>;

    // History

    /// Highest recorded snapshot version, 0 when there is none.
    fn max_version(
        &self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
    ) -> Result<u64, StorageError>;

    /// Append a snapshot. Fails with `VersionConflict` if the version is taken.
    fn insert_snapshot(
        &mut self,
        descriptor: &TypeDescriptor,
        snapshot: &HistorySnapshot,
    ) -> Result<(), StorageError>;

    fn get_history(
        &self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
    ) -> Result<Vec<HistorySnapshot>, StorageError>;

    fn get_snapshot(
        &self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
        version: u64,
    ) -> Result<Option<HistorySnapshot>, StorageError>;

    // Join history

    fn max_join_version(
        &self,
        join: &JoinSpec,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> Result<u64, StorageError>;

    fn insert_join_record(&mut self, join: &JoinSpec, record: &JoinRecord) -> Result<(), StorageError>;

    fn get_join_history(
        &self,
        join: &JoinSpec,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> Result<Vec<JoinRecord>, StorageError>;

    /// Join rows for an owner recorded at or before `owner_version`, oldest first.
    fn get_join_records_until(
        &self,
        join: &JoinSpec,
        owner_id: EntityId,
        owner_version: u64,
    ) -> Result<Vec<JoinRecord>, StorageError>;

    // Conflicts

    /// The pending conflict of an entity. There is at most one.
    fn find_conflict(
        &self,
        kind: EntityKind,
        entity_id: EntityId,
    ) -> Result<Option<ConflictRecord>, StorageError>;

    fn insert_conflict(&mut self, record: &ConflictRecord) -> Result<(), StorageError>;

    /// Replace the incoming side and scope of a pending conflict. The original side is kept.
    fn refresh_conflict(&mut self, record: &ConflictRecord) -> Result<(), StorageError>;

    fn get_conflicts(&self, kind: EntityKind) -> Result<Vec<ConflictRecord>, StorageError>;

    fn get_conflicts_for_entity(
        &self,
        kind: EntityKind,
        entity_id: EntityId,
    ) -> Result<Vec<ConflictRecord>, StorageError>;

    /// Item or attribute conflicts that `scope_id` last submitted inside `story_id`.
    fn get_member_conflicts_for_story(
        &self,
        kind: EntityKind,
        scope_id: &ScopeId,
        story_id: EntityId,
    ) -> Result<Vec<ConflictRecord>, StorageError>;

    fn delete_conflict(&mut self, kind: EntityKind, conflict_id: ConflictId) -> Result<(), StorageError>;

    fn delete_conflicts_for_entity(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
    ) -> Result<usize, StorageError>;

    fn conflict_count(&self, kind: EntityKind) -> Result<u64, StorageError>;
}
