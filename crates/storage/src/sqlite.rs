use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

use storyledger_core::{
    registry::{JoinSpec, TypeDescriptor},
    ActorId, AggregateState, ChangeKind, ConflictId, EntityId, EntityKind, EntityRegistry,
    FieldValue, HistorySnapshot, ScopeId, SnapshotDigest,
};

use crate::error::StorageError;
use crate::traits::{ConflictRecord, EntityRecord, IncomingParent, JoinRecord, Storage};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn entity_id_from(v: Vec<u8>, label: &str) -> Result<EntityId, StorageError> {
    Ok(EntityId::from_bytes(to_array::<16>(v, label)?))
}

/// Versions and counts are stored as SQLite INTEGER (i64).
fn to_sql_int(value: u64, label: &str) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("{label} {value} out of range")))
}

fn from_sql_int(value: i64, label: &str) -> Result<u64, StorageError> {
    u64::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("{label} {value} out of range")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn conflict_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Story => "story_conflicts",
        EntityKind::NewsItem => "news_item_conflicts",
        EntityKind::Attribute => "attribute_conflicts",
    }
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str, registry: &EntityRegistry) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn, registry)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory(registry: &EntityRegistry) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn, registry)?;
        Ok(Self { conn })
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StorageError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn decode_snapshot(bytes: Vec<u8>) -> Result<HistorySnapshot, StorageError> {
    Ok(HistorySnapshot::from_msgpack(&bytes)?)
}

type RawJoinRow = (Vec<u8>, Vec<u8>, i64, i64, i64, bool, i64, String);

fn read_join_row(row: &rusqlite::Row) -> rusqlite::Result<RawJoinRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_join_row(raw: RawJoinRow) -> Result<JoinRecord, StorageError> {
    let (owner, member, version, owner_version, member_version, linked, changed_at, changed_by) =
        raw;
    Ok(JoinRecord {
        owner_id: entity_id_from(owner, "owner_id")?,
        member_id: entity_id_from(member, "member_id")?,
        version: from_sql_int(version, "join version")?,
        owner_version: from_sql_int(owner_version, "owner version")?,
        member_version: from_sql_int(member_version, "member version")?,
        linked,
        changed_at,
        changed_by: ActorId::new(changed_by),
    })
}

const CONFLICT_COLUMNS: &str = "conflict_id, entity_id, scope_id, base_version, current_version, original, incoming, incoming_digest, created_at, updated_at";

struct RawConflictRow {
    conflict_id: Vec<u8>,
    entity_id: Vec<u8>,
    scope_id: String,
    base_version: Option<i64>,
    current_version: i64,
    original: Vec<u8>,
    incoming: Vec<u8>,
    incoming_digest: Vec<u8>,
    created_at: i64,
    updated_at: i64,
    parent: Option<(Vec<u8>, Vec<u8>)>,
}

fn read_conflict_row(row: &rusqlite::Row, with_parent: bool) -> rusqlite::Result<RawConflictRow> {
    let parent = if with_parent {
        Some((row.get(10)?, row.get(11)?))
    } else {
        None
    };
    Ok(RawConflictRow {
        conflict_id: row.get(0)?,
        entity_id: row.get(1)?,
        scope_id: row.get(2)?,
        base_version: row.get(3)?,
        current_version: row.get(4)?,
        original: row.get(5)?,
        incoming: row.get(6)?,
        incoming_digest: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        parent,
    })
}

fn decode_conflict_row(kind: EntityKind, raw: RawConflictRow) -> Result<ConflictRecord, StorageError> {
    let incoming_parent = match raw.parent {
        Some((story_id, story)) => Some(IncomingParent {
            story_id: entity_id_from(story_id, "incoming_story_id")?,
            story: AggregateState::from_msgpack(&story)?,
        }),
        None => None,
    };
    Ok(ConflictRecord {
        conflict_id: ConflictId::from_bytes(to_array::<16>(raw.conflict_id, "conflict_id")?),
        kind,
        entity_id: entity_id_from(raw.entity_id, "entity_id")?,
        scope_id: ScopeId::new(raw.scope_id),
        base_version: raw
            .base_version
            .map(|v| from_sql_int(v, "base_version"))
            .transpose()?,
        current_version: from_sql_int(raw.current_version, "current_version")?,
        original: AggregateState::from_msgpack(&raw.original)?,
        incoming: AggregateState::from_msgpack(&raw.incoming)?,
        incoming_digest: SnapshotDigest::from_bytes(to_array::<32>(
            raw.incoming_digest,
            "incoming_digest",
        )?),
        incoming_parent,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}

impl SqliteStorage {
    fn conflict_select(&self, kind: EntityKind) -> (String, bool) {
        let table = conflict_table(kind);
        let with_parent = kind != EntityKind::Story;
        let extra = if with_parent {
            ", incoming_story_id, incoming_story"
        } else {
            ""
        };
        (
            format!("SELECT {CONFLICT_COLUMNS}{extra} FROM {table}"),
            with_parent,
        )
    }

    fn query_conflicts(
        &self,
        kind: EntityKind,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        let (select, with_parent) = self.conflict_select(kind);
        let mut stmt = self
            .conn
            .prepare(&format!("{select} {filter} ORDER BY created_at, conflict_id"))?;
        let rows = stmt.query_map(params, |row| read_conflict_row(row, with_parent))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(decode_conflict_row(kind, row?)?);
        }
        Ok(result)
    }
}

impl Storage for SqliteStorage {
    fn get_entity(&self, entity_id: EntityId) -> Result<Option<EntityRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT kind, version, created_at, updated_at, (deleted_at IS NOT NULL) FROM entities WHERE entity_id = ?1",
                rusqlite::params![entity_id.as_bytes().as_slice()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((kind, version, created_at, updated_at, deleted)) => Ok(Some(EntityRecord {
                entity_id,
                kind: EntityKind::parse(&kind)?,
                version: from_sql_int(version, "version")?,
                created_at,
                updated_at,
                deleted,
            })),
            None => Ok(None),
        }
    }

    fn get_entities_by_kind(&self, kind: EntityKind) -> Result<Vec<EntityId>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id FROM entities WHERE kind = ?1 AND deleted_at IS NULL ORDER BY entity_id",
        )?;
        let rows = stmt.query_map(rusqlite::params![kind.as_str()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(entity_id_from(row?, "entity_id")?);
        }
        Ok(result)
    }

    fn insert_entity(
        &mut self,
        entity_id: EntityId,
        kind: EntityKind,
        now: i64,
    ) -> Result<(), StorageError> {
        let result = self.conn.execute(
            "INSERT INTO entities (entity_id, kind, version, created_at, updated_at) VALUES (?1, ?2, 1, ?3, ?3)",
            rusqlite::params![entity_id.as_bytes().as_slice(), kind.as_str(), now],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StorageError::EntityCollision {
                entity_id: entity_id.to_string(),
            }),
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn set_entity_version(
        &mut self,
        entity_id: EntityId,
        version: u64,
        now: i64,
    ) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE entities SET version = ?1, updated_at = ?2 WHERE entity_id = ?3",
            rusqlite::params![to_sql_int(version, "version")?, now, entity_id.as_bytes().as_slice()],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(entity_id.to_string()));
        }
        Ok(())
    }

    fn mark_deleted(&mut self, entity_id: EntityId, now: i64) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE entities SET deleted_at = ?1, updated_at = ?1 WHERE entity_id = ?2",
            rusqlite::params![now, entity_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    fn load_state(
        &self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
    ) -> Result<AggregateState, StorageError> {
        let mut state = AggregateState::new();

        let mut stmt = self
            .conn
            .prepare("SELECT field_key, value FROM fields WHERE entity_id = ?1")?;
        let rows = stmt.query_map(
            rusqlite::params![entity_id.as_bytes().as_slice()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )?;
        for row in rows {
            let (key, val_bytes) = row?;
            let value = FieldValue::from_msgpack(&val_bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            state.fields.insert(key, value);
        }

        let mut stmt = self.conn.prepare(
            "SELECT member_id FROM relations WHERE owner_id = ?1 AND relation = ?2 ORDER BY position",
        )?;
        for relation in descriptor.relations {
            let rows = stmt.query_map(
                rusqlite::params![entity_id.as_bytes().as_slice(), relation.name],
                |row| row.get::<_, Vec<u8>>(0),
            )?;
            let mut members = Vec::new();
            for row in rows {
                members.push(entity_id_from(row?, "member_id")?);
            }
            if !members.is_empty() {
                state.relations.insert(relation.name.to_string(), members);
            }
        }
        Ok(state)
    }

    fn replace_fields(
        &mut self,
        entity_id: EntityId,
        state: &AggregateState,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM fields WHERE entity_id = ?1",
            rusqlite::params![entity_id.as_bytes().as_slice()],
        )?;
        let mut stmt = self
            .conn
            .prepare("INSERT INTO fields (entity_id, field_key, value) VALUES (?1, ?2, ?3)")?;
        for (key, value) in &state.fields {
            // Null is stored as an absent row.
            if value.is_null() {
                continue;
            }
            let value_bytes = value
                .to_msgpack()
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            stmt.execute(rusqlite::params![
                entity_id.as_bytes().as_slice(),
                key,
                value_bytes
            ])?;
        }
        Ok(())
    }

    fn replace_members(
        &mut self,
        entity_id: EntityId,
        relation: &str,
        members: &[EntityId],
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM relations WHERE owner_id = ?1 AND relation = ?2",
            rusqlite::params![entity_id.as_bytes().as_slice(), relation],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO relations (owner_id, relation, member_id, position) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (position, member) in members.iter().enumerate() {
            stmt.execute(rusqlite::params![
                entity_id.as_bytes().as_slice(),
                relation,
                member.as_bytes().as_slice(),
                i64::try_from(position)
                    .map_err(|_| StorageError::Serialization(format!("position {position} out of range")))?,
            ])?;
        }
        Ok(())
    }

    fn get_owners(&self, member_id: EntityId, relation: &str) -> Result<Vec<EntityId>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT owner_id FROM relations WHERE member_id = ?1 AND relation = ?2 ORDER BY owner_id",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![member_id.as_bytes().as_slice(), relation],
            |row| row.get::<_, Vec<u8>>(0),
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(entity_id_from(row?, "owner_id")?);
        }
        Ok(result)
    }

    fn max_version(
        &self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
    ) -> Result<u64, StorageError> {
        let max: i64 = self.conn.query_row(
            &format!(
                "SELECT COALESCE(MAX(version), 0) FROM {} WHERE entity_id = ?1",
                descriptor.history_table
            ),
            rusqlite::params![entity_id.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        from_sql_int(max, "version")
    }

    fn insert_snapshot(
        &mut self,
        descriptor: &TypeDescriptor,
        snapshot: &HistorySnapshot,
    ) -> Result<(), StorageError> {
        let bytes = snapshot.to_msgpack()?;
        let result = self.conn.execute(
            &format!(
                "INSERT INTO {} (entity_id, version, changed_at, changed_by, change_kind, snapshot) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                descriptor.history_table
            ),
            rusqlite::params![
                snapshot.entity_id.as_bytes().as_slice(),
                to_sql_int(snapshot.version, "version")?,
                snapshot.changed_at,
                snapshot.changed_by.as_str(),
                snapshot.change.as_str(),
                bytes,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StorageError::VersionConflict {
                kind: descriptor.kind,
                entity_id: snapshot.entity_id,
                version: snapshot.version,
            }),
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn get_history(
        &self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
    ) -> Result<Vec<HistorySnapshot>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT snapshot, change_kind FROM {} WHERE entity_id = ?1 ORDER BY version",
            descriptor.history_table
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![entity_id.as_bytes().as_slice()],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
        )?;

        let mut result = Vec::new();
        for row in rows {
            let (bytes, change_kind) = row?;
            let snapshot = decode_snapshot(bytes)?;
            if ChangeKind::parse(&change_kind)? != snapshot.change {
                return Err(StorageError::Serialization(format!(
                    "change kind column disagrees with snapshot {}@{}",
                    snapshot.entity_id, snapshot.version
                )));
            }
            result.push(snapshot);
        }
        Ok(result)
    }

    fn get_snapshot(
        &self,
        descriptor: &TypeDescriptor,
        entity_id: EntityId,
        version: u64,
    ) -> Result<Option<HistorySnapshot>, StorageError> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                &format!(
                    "SELECT snapshot FROM {} WHERE entity_id = ?1 AND version = ?2",
                    descriptor.history_table
                ),
                rusqlite::params![entity_id.as_bytes().as_slice(), to_sql_int(version, "version")?],
                |row| row.get(0),
            )
            .optional()?;
        bytes.map(decode_snapshot).transpose()
    }

    fn max_join_version(
        &self,
        join: &JoinSpec,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> Result<u64, StorageError> {
        let max: i64 = self.conn.query_row(
            &format!(
                "SELECT COALESCE(MAX(version), 0) FROM {} WHERE owner_id = ?1 AND member_id = ?2",
                join.history_table
            ),
            rusqlite::params![
                owner_id.as_bytes().as_slice(),
                member_id.as_bytes().as_slice()
            ],
            |row| row.get(0),
        )?;
        from_sql_int(max, "join version")
    }

    fn insert_join_record(&mut self, join: &JoinSpec, record: &JoinRecord) -> Result<(), StorageError> {
        let result = self.conn.execute(
            &format!(
                "INSERT INTO {table} (owner_id, member_id, version, {owner_col}, {member_col}, linked, changed_at, changed_by) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                table = join.history_table,
                owner_col = join.owner_version_column,
                member_col = join.member_version_column,
            ),
            rusqlite::params![
                record.owner_id.as_bytes().as_slice(),
                record.member_id.as_bytes().as_slice(),
                to_sql_int(record.version, "join version")?,
                to_sql_int(record.owner_version, "owner version")?,
                to_sql_int(record.member_version, "member version")?,
                record.linked,
                record.changed_at,
                record.changed_by.as_str(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StorageError::ConstraintViolation(
                format!(
                    "{} already has version {} for {} -> {}",
                    join.history_table, record.version, record.owner_id, record.member_id
                ),
            )),
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn get_join_history(
        &self,
        join: &JoinSpec,
        owner_id: EntityId,
        member_id: EntityId,
    ) -> Result<Vec<JoinRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT owner_id, member_id, version, {owner_col}, {member_col}, linked, changed_at, changed_by FROM {table} WHERE owner_id = ?1 AND member_id = ?2 ORDER BY version",
            table = join.history_table,
            owner_col = join.owner_version_column,
            member_col = join.member_version_column,
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![
                owner_id.as_bytes().as_slice(),
                member_id.as_bytes().as_slice()
            ],
            read_join_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(decode_join_row(row?)?);
        }
        Ok(result)
    }

    fn get_join_records_until(
        &self,
        join: &JoinSpec,
        owner_id: EntityId,
        owner_version: u64,
    ) -> Result<Vec<JoinRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT owner_id, member_id, version, {owner_col}, {member_col}, linked, changed_at, changed_by FROM {table} WHERE owner_id = ?1 AND {owner_col} <= ?2 ORDER BY {owner_col}, member_id, version",
            table = join.history_table,
            owner_col = join.owner_version_column,
            member_col = join.member_version_column,
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![
                owner_id.as_bytes().as_slice(),
                to_sql_int(owner_version, "owner version")?
            ],
            read_join_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(decode_join_row(row?)?);
        }
        Ok(result)
    }

    fn find_conflict(
        &self,
        kind: EntityKind,
        entity_id: EntityId,
    ) -> Result<Option<ConflictRecord>, StorageError> {
        let mut found = self.query_conflicts(
            kind,
            "WHERE entity_id = ?1",
            rusqlite::params![entity_id.as_bytes().as_slice()],
        )?;
        Ok(found.pop())
    }

    fn insert_conflict(&mut self, record: &ConflictRecord) -> Result<(), StorageError> {
        let table = conflict_table(record.kind);
        let original = record.original.to_msgpack()?;
        let incoming = record.incoming.to_msgpack()?;
        let base_version = record
            .base_version
            .map(|v| to_sql_int(v, "base_version"))
            .transpose()?;
        let current_version = to_sql_int(record.current_version, "current_version")?;

        match &record.incoming_parent {
            Some(parent) => {
                self.conn.execute(
                    &format!(
                        "INSERT INTO {table} ({CONFLICT_COLUMNS}, incoming_story_id, incoming_story) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                    ),
                    rusqlite::params![
                        record.conflict_id.as_bytes().as_slice(),
                        record.entity_id.as_bytes().as_slice(),
                        record.scope_id.as_str(),
                        base_version,
                        current_version,
                        original,
                        incoming,
                        record.incoming_digest.as_bytes().as_slice(),
                        record.created_at,
                        record.updated_at,
                        parent.story_id.as_bytes().as_slice(),
                        parent.story.to_msgpack()?,
                    ],
                )?;
            }
            None => {
                self.conn.execute(
                    &format!(
                        "INSERT INTO {table} ({CONFLICT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                    ),
                    rusqlite::params![
                        record.conflict_id.as_bytes().as_slice(),
                        record.entity_id.as_bytes().as_slice(),
                        record.scope_id.as_str(),
                        base_version,
                        current_version,
                        original,
                        incoming,
                        record.incoming_digest.as_bytes().as_slice(),
                        record.created_at,
                        record.updated_at,
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn refresh_conflict(&mut self, record: &ConflictRecord) -> Result<(), StorageError> {
        let table = conflict_table(record.kind);
        let incoming = record.incoming.to_msgpack()?;
        let base_version = record
            .base_version
            .map(|v| to_sql_int(v, "base_version"))
            .transpose()?;
        let current_version = to_sql_int(record.current_version, "current_version")?;

        let updated = match &record.incoming_parent {
            Some(parent) => self.conn.execute(
                &format!(
                    "UPDATE {table} SET scope_id = ?1, base_version = ?2, current_version = ?3, incoming = ?4, incoming_digest = ?5, updated_at = ?6, incoming_story_id = ?7, incoming_story = ?8 WHERE conflict_id = ?9"
                ),
                rusqlite::params![
                    record.scope_id.as_str(),
                    base_version,
                    current_version,
                    incoming,
                    record.incoming_digest.as_bytes().as_slice(),
                    record.updated_at,
                    parent.story_id.as_bytes().as_slice(),
                    parent.story.to_msgpack()?,
                    record.conflict_id.as_bytes().as_slice(),
                ],
            )?,
            None => self.conn.execute(
                &format!(
                    "UPDATE {table} SET scope_id = ?1, base_version = ?2, current_version = ?3, incoming = ?4, incoming_digest = ?5, updated_at = ?6 WHERE conflict_id = ?7"
                ),
                rusqlite::params![
                    record.scope_id.as_str(),
                    base_version,
                    current_version,
                    incoming,
                    record.incoming_digest.as_bytes().as_slice(),
                    record.updated_at,
                    record.conflict_id.as_bytes().as_slice(),
                ],
            )?,
        };
        if updated == 0 {
            return Err(StorageError::NotFound(record.conflict_id.to_string()));
        }
        Ok(())
    }

    fn get_conflicts(&self, kind: EntityKind) -> Result<Vec<ConflictRecord>, StorageError> {
        self.query_conflicts(kind, "", rusqlite::params![])
    }

    fn get_conflicts_for_entity(
        &self,
        kind: EntityKind,
        entity_id: EntityId,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        self.query_conflicts(
            kind,
            "WHERE entity_id = ?1",
            rusqlite::params![entity_id.as_bytes().as_slice()],
        )
    }

    fn get_member_conflicts_for_story(
        &self,
        kind: EntityKind,
        scope_id: &ScopeId,
        story_id: EntityId,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        if kind == EntityKind::Story {
            return Ok(Vec::new());
        }
        self.query_conflicts(
            kind,
            "WHERE scope_id = ?1 AND incoming_story_id = ?2",
            rusqlite::params![scope_id.as_str(), story_id.as_bytes().as_slice()],
        )
    }

    fn delete_conflict(&mut self, kind: EntityKind, conflict_id: ConflictId) -> Result<(), StorageError> {
        let table = conflict_table(kind);
        self.conn.execute(
            &format!("DELETE FROM {table} WHERE conflict_id = ?1"),
            rusqlite::params![conflict_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    fn delete_conflicts_for_entity(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
    ) -> Result<usize, StorageError> {
        let table = conflict_table(kind);
        let deleted = self.conn.execute(
            &format!("DELETE FROM {table} WHERE entity_id = ?1"),
            rusqlite::params![entity_id.as_bytes().as_slice()],
        )?;
        Ok(deleted)
    }

    fn conflict_count(&self, kind: EntityKind) -> Result<u64, StorageError> {
        let table = conflict_table(kind);
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        from_sql_int(count, "conflict count")
    }
}
