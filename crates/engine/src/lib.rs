pub mod config;
pub mod conflicts;
pub mod error;
pub mod resolution;
pub mod submission;

pub use config::EngineConfig;
pub use conflicts::ConflictSummary;
pub use error::EngineError;
pub use resolution::{Resolution, ResolvedEntity};
pub use submission::{AppliedStory, AttributeBundle, NewsItemBundle, StoryBundle, Submission};

use std::collections::BTreeMap;
use std::time::Duration;

use storyledger_core::{
    registry::{RelationSpec, TypeDescriptor},
    time, AggregateState, ChangeContext, ChangeDetector, ChangeKind, ChangeSet, EntityId,
    EntityKind, EntityRegistry, HistorySnapshot, MemberRef,
};
use storyledger_storage::{JoinRecord, SqliteStorage, Storage, StorageError};
use tracing::{debug, info, warn};

/// Current state of one aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub version: u64,
    pub state: AggregateState,
}

/// A join history row that could not be written because a parent was missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvableParent {
    pub relation: &'static str,
    pub owner_id: EntityId,
    pub member_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    /// New version, or the unchanged current version for a no-op.
    pub version: u64,
    pub change: ChangeSet,
    pub skipped_joins: Vec<UnresolvableParent>,
}

impl CommitOutcome {
    pub fn is_noop(&self) -> bool {
        !self.change.is_material()
    }
}

pub struct Engine {
    registry: EntityRegistry,
    storage: SqliteStorage,
    config: EngineConfig,
}

impl Engine {
    pub fn new(registry: EntityRegistry, storage: SqliteStorage, config: EngineConfig) -> Self {
        Self {
            registry,
            storage,
            config,
        }
    }

    /// Open the database named by `config` with the standard registry.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let registry = EntityRegistry::standard()?;
        let storage = match &config.database_path {
            Some(path) => SqliteStorage::open(path, &registry)?,
            None => SqliteStorage::open_in_memory(&registry)?,
        };
        storage.set_busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        info!(path = ?config.database_path, "opened entity store");
        Ok(Self::new(registry, storage, config))
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        Self::open(EngineConfig::default())
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a batch SQL statement on the underlying connection, mapping errors.
    fn exec_batch(&self, sql: &str) -> Result<(), EngineError> {
        self.storage
            .conn()
            .execute_batch(sql)
            .map_err(|e| EngineError::Storage(StorageError::Sqlite(e)))
    }

    /// Run `f` inside an immediate (write-locking) transaction.
    pub(crate) fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.exec_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.exec_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.exec_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn descriptor(&self, kind: EntityKind) -> Result<TypeDescriptor, EngineError> {
        Ok(*self.registry.get(kind)?)
    }

    // ========================================================================
    // Commit path
    // ========================================================================

    /// Commit the final state of one logical operation on an aggregate.
    ///
    /// `proposed: None` deletes. Writes at most one history snapshot.
    pub fn commit_change(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
        proposed: Option<AggregateState>,
        ctx: &ChangeContext,
    ) -> Result<CommitOutcome, EngineError> {
        self.transaction(|engine| engine.apply_change(kind, entity_id, proposed, ctx))
    }

    /// Create a new aggregate with a fresh id.
    pub fn create(
        &mut self,
        kind: EntityKind,
        state: AggregateState,
        ctx: &ChangeContext,
    ) -> Result<CommitOutcome, EngineError> {
        self.commit_change(kind, EntityId::new(), Some(state), ctx)
    }

    /// Load the current state, let `edit` change it, and commit the result once.
    pub fn modify(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
        ctx: &ChangeContext,
        edit: impl FnOnce(&mut AggregateState),
    ) -> Result<CommitOutcome, EngineError> {
        self.transaction(|engine| {
            let mut state = engine.require_live(kind, entity_id)?.state;
            edit(&mut state);
            engine.apply_change(kind, entity_id, Some(state), ctx)
        })
    }

    pub fn delete(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
        ctx: &ChangeContext,
    ) -> Result<CommitOutcome, EngineError> {
        self.commit_change(kind, entity_id, None, ctx)
    }

    /// Commit inside an already-open transaction.
    pub(crate) fn apply_change(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
        proposed: Option<AggregateState>,
        ctx: &ChangeContext,
    ) -> Result<CommitOutcome, EngineError> {
        let descriptor = self.descriptor(kind)?;
        if let Some(state) = &proposed {
            descriptor.check_state(state).map_err(EngineError::invalid)?;
            self.check_member_kinds(&descriptor, state)?;
        }

        let record = self.storage.get_entity(entity_id)?;
        let (previous, current_version) = match &record {
            Some(r) if r.kind != kind => {
                return Err(EngineError::KindMismatch {
                    entity_id,
                    expected: kind,
                    actual: r.kind,
                });
            }
            Some(r) if r.deleted => {
                return Err(EngineError::EntityDeleted(entity_id.to_string()));
            }
            Some(r) => (Some(self.storage.load_state(&descriptor, entity_id)?), r.version),
            None if proposed.is_none() => {
                return Err(EngineError::EntityNotFound(entity_id.to_string()));
            }
            None => (None, 0),
        };

        let change = ChangeDetector::new(&descriptor).classify(previous.as_ref(), proposed.as_ref())?;
        if !change.is_material() {
            debug!(%kind, %entity_id, version = current_version, "no material change");
            return Ok(CommitOutcome {
                entity_id,
                kind,
                version: current_version,
                change,
                skipped_joins: Vec::new(),
            });
        }

        let final_state = match (&proposed, &previous) {
            (Some(state), _) => state.clone(),
            // Deleted aggregates keep their last field values and lose their memberships.
            (None, Some(prev)) => AggregateState {
                fields: prev.fields.clone(),
                relations: BTreeMap::new(),
            },
            (None, None) => AggregateState::new(),
        };

        let retries = self.config.max_version_retries;
        for attempt in 0..=retries {
            let version = self.next_version(&descriptor, entity_id, attempt > 0)?;
            self.exec_batch("SAVEPOINT commit_change")?;
            match self.write_version(&descriptor, entity_id, version, &final_state, &change, ctx) {
                Ok(outcome) => {
                    self.exec_batch("RELEASE commit_change")?;
                    info!(
                        %kind,
                        %entity_id,
                        version = outcome.version,
                        change = change.kind.as_str(),
                        actor = %ctx.actor,
                        origin = ?ctx.origin,
                        "committed change"
                    );
                    return Ok(outcome);
                }
                Err(EngineError::Storage(StorageError::VersionConflict { version, .. })) => {
                    self.exec_batch("ROLLBACK TO commit_change; RELEASE commit_change")?;
                    warn!(%kind, %entity_id, version, attempt, "snapshot version taken, retrying");
                }
                Err(e) => {
                    let _ = self.exec_batch("ROLLBACK TO commit_change; RELEASE commit_change");
                    return Err(e);
                }
            }
        }
        Err(EngineError::VersionConflict {
            kind,
            entity_id,
            attempts: retries + 1,
        })
    }

    /// Members that already exist must be of the relation's target kind.
    fn check_member_kinds(
        &self,
        descriptor: &TypeDescriptor,
        state: &AggregateState,
    ) -> Result<(), EngineError> {
        for relation in descriptor.relations {
            for member in state.members(relation.name) {
                if let Some(record) = self.storage.get_entity(*member)?
                    && record.kind != relation.target
                {
                    return Err(EngineError::Validation(format!(
                        "{}.{} expects {} members, {member} is a {}",
                        descriptor.kind, relation.name, relation.target, record.kind
                    )));
                }
            }
        }
        Ok(())
    }

    /// The entity row's counter plus one. After a snapshot collision the
    /// history table's highest version counts too.
    fn next_version(
        &self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
        after_collision: bool,
    ) -> Result<u64, EngineError> {
        let counter = self
            .storage
            .get_entity(entity_id)?
            .map_or(0, |r| r.version);
        let current = if after_collision {
            counter.max(self.storage.max_version(descriptor, entity_id)?)
        } else {
            counter
        };
        current
            .checked_add(1)
            .ok_or_else(|| EngineError::Validation(format!("{entity_id} has no versions left")))
    }

    /// One history snapshot for the new version, plus join rows.
    fn write_version(
        &mut self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
        version: u64,
        state: &AggregateState,
        change: &ChangeSet,
        ctx: &ChangeContext,
    ) -> Result<CommitOutcome, EngineError> {
        let now = time::now_ms()?;

        match change.kind {
            ChangeKind::Created => self.storage.insert_entity(entity_id, descriptor.kind, now)?,
            ChangeKind::Deleted => self.storage.mark_deleted(entity_id, now)?,
            _ => {}
        }
        self.storage.replace_fields(entity_id, state)?;
        for relation in descriptor.relations {
            self.storage
                .replace_members(entity_id, relation.name, state.members(relation.name))?;
        }
        self.storage.set_entity_version(entity_id, version, now)?;

        let mut relations = BTreeMap::new();
        for relation in descriptor.relations {
            let members = state.members(relation.name);
            if members.is_empty() {
                continue;
            }
            let mut refs = Vec::with_capacity(members.len());
            for member in members {
                refs.push(MemberRef {
                    entity_id: *member,
                    version: self.live_version(*member)?,
                });
            }
            relations.insert(relation.name.to_string(), refs);
        }

        let snapshot = HistorySnapshot {
            entity_id,
            kind: descriptor.kind,
            version,
            changed_at: now,
            changed_by: ctx.actor.clone(),
            origin: ctx.origin.clone(),
            change: change.kind,
            fields: state.fields.clone(),
            relations,
        };
        self.storage.insert_snapshot(descriptor, &snapshot)?;

        let mut skipped_joins = Vec::new();
        for relation in descriptor.relations {
            let Some(diff) = change.relation(relation.name) else {
                continue;
            };
            for (member, linked) in diff
                .added
                .iter()
                .map(|m| (*m, true))
                .chain(diff.removed.iter().map(|m| (*m, false)))
            {
                if let Some(skipped) =
                    self.write_join(relation, entity_id, version, member, linked, ctx, now)?
                {
                    skipped_joins.push(skipped);
                }
            }
        }

        Ok(CommitOutcome {
            entity_id,
            kind: descriptor.kind,
            version,
            change: change.clone(),
            skipped_joins,
        })
    }

    /// Append a join history row stamped with both parents' versions.
    #[allow(clippy::too_many_arguments)]
    fn write_join(
        &mut self,
        relation: &RelationSpec,
        owner_id: EntityId,
        owner_version: u64,
        member_id: EntityId,
        linked: bool,
        ctx: &ChangeContext,
        now: i64,
    ) -> Result<Option<UnresolvableParent>, EngineError> {
        let Some(join) = &relation.join else {
            return Ok(None);
        };
        let Some(member_version) = self.live_version(member_id)? else {
            debug!(
                relation = relation.name,
                %owner_id,
                %member_id,
                "join parent not resolvable, skipping join history"
            );
            return Ok(Some(UnresolvableParent {
                relation: relation.name,
                owner_id,
                member_id,
            }));
        };

        let version = self.storage.max_join_version(join, owner_id, member_id)? + 1;
        self.storage.insert_join_record(
            join,
            &JoinRecord {
                owner_id,
                member_id,
                version,
                owner_version,
                member_version,
                linked,
                changed_at: now,
                changed_by: ctx.actor.clone(),
            },
        )?;
        Ok(None)
    }

    fn live_version(&self, entity_id: EntityId) -> Result<Option<u64>, EngineError> {
        Ok(self
            .storage
            .get_entity(entity_id)?
            .filter(|r| !r.deleted)
            .map(|r| r.version))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_aggregate(&self, entity_id: EntityId) -> Result<Option<Aggregate>, EngineError> {
        let Some(record) = self.storage.get_entity(entity_id)? else {
            return Ok(None);
        };
        if record.deleted {
            return Ok(None);
        }
        let descriptor = self.descriptor(record.kind)?;
        Ok(Some(Aggregate {
            entity_id,
            kind: record.kind,
            version: record.version,
            state: self.storage.load_state(&descriptor, entity_id)?,
        }))
    }

    /// Current aggregate of the given kind, or an error if missing or deleted.
    pub fn require_live(&self, kind: EntityKind, entity_id: EntityId) -> Result<Aggregate, EngineError> {
        match self.storage.get_entity(entity_id)? {
            None => Err(EngineError::EntityNotFound(entity_id.to_string())),
            Some(r) if r.deleted => Err(EngineError::EntityDeleted(entity_id.to_string())),
            Some(r) if r.kind != kind => Err(EngineError::KindMismatch {
                entity_id,
                expected: kind,
                actual: r.kind,
            }),
            Some(_) => self
                .get_aggregate(entity_id)?
                .ok_or_else(|| EngineError::EntityNotFound(entity_id.to_string())),
        }
    }

    pub fn list(&self, kind: EntityKind) -> Result<Vec<EntityId>, EngineError> {
        Ok(self.storage.get_entities_by_kind(kind)?)
    }

    pub fn history(
        &self,
        kind: EntityKind,
        entity_id: EntityId,
    ) -> Result<Vec<HistorySnapshot>, EngineError> {
        let descriptor = self.descriptor(kind)?;
        Ok(self.storage.get_history(&descriptor, entity_id)?)
    }

    pub fn snapshot_at(
        &self,
        kind: EntityKind,
        entity_id: EntityId,
        version: u64,
    ) -> Result<Option<HistorySnapshot>, EngineError> {
        let descriptor = self.descriptor(kind)?;
        Ok(self.storage.get_snapshot(&descriptor, entity_id, version)?)
    }

    fn join_relation(
        &self,
        owner_kind: EntityKind,
        relation: &str,
    ) -> Result<RelationSpec, EngineError> {
        let descriptor = self.descriptor(owner_kind)?;
        descriptor
            .relation(relation)
            .filter(|r| r.join.is_some())
            .copied()
            .ok_or_else(|| {
                EngineError::Validation(format!("{owner_kind}.{relation} is not a versioned join"))
            })
    }

    pub fn join_history(
        &self,
        owner_kind: EntityKind,
        relation: &str,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> Result<Vec<JoinRecord>, EngineError> {
        let spec = self.join_relation(owner_kind, relation)?;
        let Some(join) = spec.join else {
            return Ok(Vec::new());
        };
        Ok(self.storage.get_join_history(&join, owner_id, member_id)?)
    }

    /// Members linked under `relation` as of `owner_version`, each with the
    /// member version recorded when it was linked.
    pub fn members_at(
        &self,
        owner_kind: EntityKind,
        owner_id: EntityId,
        relation: &str,
        owner_version: u64,
    ) -> Result<Vec<MemberRef>, EngineError> {
        let spec = self.join_relation(owner_kind, relation)?;
        let Some(join) = spec.join else {
            return Ok(Vec::new());
        };
        let mut latest: BTreeMap<EntityId, JoinRecord> = BTreeMap::new();
        for record in self
            .storage
            .get_join_records_until(&join, owner_id, owner_version)?
        {
            latest.insert(record.member_id, record);
        }
        Ok(latest
            .into_values()
            .filter(|r| r.linked)
            .map(|r| MemberRef {
                entity_id: r.member_id,
                version: Some(r.member_version),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyledger_core::{registry::STORY, ActorId, ChangeOrigin, FieldValue};

    fn story(title: &str) -> AggregateState {
        AggregateState::new().with_field("title", title)
    }

    /// A history row written behind the entity counter's back.
    fn stray_snapshot(entity_id: EntityId, version: u64) -> HistorySnapshot {
        HistorySnapshot {
            entity_id,
            kind: EntityKind::Story,
            version,
            changed_at: 0,
            changed_by: ActorId::new("importer"),
            origin: ChangeOrigin::Local,
            change: ChangeKind::FieldChange,
            fields: story("imported").fields,
            relations: BTreeMap::new(),
        }
    }

    fn versions(engine: &Engine, id: EntityId) -> Vec<u64> {
        engine
            .history(EntityKind::Story, id)
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect()
    }

    #[test]
    fn snapshot_collision_retries_past_the_taken_version() {
        let mut engine = Engine::open_in_memory().unwrap();
        let ctx = ChangeContext::local("editor");
        let id = engine
            .create(EntityKind::Story, story("Draft"), &ctx)
            .unwrap()
            .entity_id;
        engine
            .storage
            .insert_snapshot(&STORY, &stray_snapshot(id, 2))
            .unwrap();

        let outcome = engine
            .commit_change(EntityKind::Story, id, Some(story("Final")), &ctx)
            .unwrap();
        assert_eq!(outcome.version, 3);

        let current = engine.require_live(EntityKind::Story, id).unwrap();
        assert_eq!(current.version, 3);
        assert_eq!(current.state.field("title"), Some(&FieldValue::Text("Final".into())));
        assert_eq!(versions(&engine, id), vec![1, 2, 3]);
    }

    #[test]
    fn exhausted_retries_report_version_conflict_and_write_nothing() {
        let config = EngineConfig {
            max_version_retries: 0,
            ..EngineConfig::default()
        };
        let mut engine = Engine::open(config).unwrap();
        let ctx = ChangeContext::local("editor");
        let id = engine
            .create(EntityKind::Story, story("Draft"), &ctx)
            .unwrap()
            .entity_id;
        engine
            .storage
            .insert_snapshot(&STORY, &stray_snapshot(id, 2))
            .unwrap();

        match engine.commit_change(EntityKind::Story, id, Some(story("Final")), &ctx) {
            Err(EngineError::VersionConflict {
                entity_id,
                attempts,
                ..
            }) => {
                assert_eq!(entity_id, id);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }

        let current = engine.require_live(EntityKind::Story, id).unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.state.field("title"), Some(&FieldValue::Text("Draft".into())));
        assert_eq!(versions(&engine, id), vec![1, 2]);
    }

    #[test]
    fn snapshots_record_where_the_change_came_from() {
        let mut engine = Engine::open_in_memory().unwrap();
        let id = engine
            .create(EntityKind::Story, story("Draft"), &ChangeContext::local("editor"))
            .unwrap()
            .entity_id;
        let scope = storyledger_core::ScopeId::new("rss");
        engine
            .commit_change(
                EntityKind::Story,
                id,
                Some(story("Pushed")),
                &ChangeContext::external("worker:rss", scope.clone()),
            )
            .unwrap();

        let history = engine.history(EntityKind::Story, id).unwrap();
        assert_eq!(history[0].origin, ChangeOrigin::Local);
        assert_eq!(history[1].origin, ChangeOrigin::External(scope));
        assert_eq!(history[1].changed_by, ActorId::new("worker:rss"));
    }
}
