use rusqlite::Connection;

use storyledger_core::EntityRegistry;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection, registry: &EntityRegistry) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, unixepoch())",
        [SCHEMA_VERSION],
    )?;

    // Shadow tables come from the registry; names were checked as identifiers on register.
    for descriptor in registry.descriptors() {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                entity_id BLOB NOT NULL CHECK (length(entity_id) = 16),
                version INTEGER NOT NULL CHECK (version >= 1),
                changed_at INTEGER NOT NULL,
                changed_by TEXT NOT NULL,
                change_kind TEXT NOT NULL,
                snapshot BLOB NOT NULL,
                PRIMARY KEY (entity_id, version)
            );",
            table = descriptor.history_table,
        ))?;
    }
    for (_, _, join) in registry.joins() {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                owner_id BLOB NOT NULL CHECK (length(owner_id) = 16),
                member_id BLOB NOT NULL CHECK (length(member_id) = 16),
                version INTEGER NOT NULL CHECK (version >= 1),
                {owner_col} INTEGER NOT NULL,
                {member_col} INTEGER NOT NULL,
                linked INTEGER NOT NULL,
                changed_at INTEGER NOT NULL,
                changed_by TEXT NOT NULL,
                PRIMARY KEY (owner_id, member_id, version)
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table} (owner_id, {owner_col});",
            table = join.history_table,
            owner_col = join.owner_version_column,
            member_col = join.member_version_column,
        ))?;
    }
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
    entity_id BLOB PRIMARY KEY CHECK (length(entity_id) = 16),
    kind TEXT NOT NULL,
    version INTEGER NOT NULL CHECK (version >= 1),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities (kind) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS fields (
    entity_id BLOB NOT NULL REFERENCES entities (entity_id),
    field_key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (entity_id, field_key)
);

CREATE TABLE IF NOT EXISTS relations (
    owner_id BLOB NOT NULL REFERENCES entities (entity_id),
    relation TEXT NOT NULL,
    member_id BLOB NOT NULL CHECK (length(member_id) = 16),
    position INTEGER NOT NULL,
    PRIMARY KEY (owner_id, relation, member_id)
);
CREATE INDEX IF NOT EXISTS idx_relations_member ON relations (member_id, relation);

-- At most one pending conflict per entity. scope_id is the producer whose
-- submission last set the incoming side.
CREATE TABLE IF NOT EXISTS story_conflicts (
    conflict_id BLOB PRIMARY KEY CHECK (length(conflict_id) = 16),
    entity_id BLOB NOT NULL UNIQUE CHECK (length(entity_id) = 16),
    scope_id TEXT NOT NULL,
    base_version INTEGER,
    current_version INTEGER NOT NULL,
    original BLOB NOT NULL,
    incoming BLOB NOT NULL,
    incoming_digest BLOB NOT NULL CHECK (length(incoming_digest) = 32),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS news_item_conflicts (
    conflict_id BLOB PRIMARY KEY CHECK (length(conflict_id) = 16),
    entity_id BLOB NOT NULL UNIQUE CHECK (length(entity_id) = 16),
    scope_id TEXT NOT NULL,
    incoming_story_id BLOB NOT NULL CHECK (length(incoming_story_id) = 16),
    incoming_story BLOB NOT NULL,
    base_version INTEGER,
    current_version INTEGER NOT NULL,
    original BLOB NOT NULL,
    incoming BLOB NOT NULL,
    incoming_digest BLOB NOT NULL CHECK (length(incoming_digest) = 32),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_news_item_conflicts_story ON news_item_conflicts (scope_id, incoming_story_id);

CREATE TABLE IF NOT EXISTS attribute_conflicts (
    conflict_id BLOB PRIMARY KEY CHECK (length(conflict_id) = 16),
    entity_id BLOB NOT NULL UNIQUE CHECK (length(entity_id) = 16),
    scope_id TEXT NOT NULL,
    incoming_story_id BLOB NOT NULL CHECK (length(incoming_story_id) = 16),
    incoming_story BLOB NOT NULL,
    base_version INTEGER,
    current_version INTEGER NOT NULL,
    original BLOB NOT NULL,
    incoming BLOB NOT NULL,
    incoming_digest BLOB NOT NULL CHECK (length(incoming_digest) = 32),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attribute_conflicts_story ON attribute_conflicts (scope_id, incoming_story_id);
";
