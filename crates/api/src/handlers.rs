//! JSON request handlers. Routing, authentication and permissions live in
//! the caller; each handler takes the already-extracted path parameters and
//! body and returns a status with a JSON body.

use std::collections::{BTreeMap, VecDeque};

use serde_json::{json, Map, Value};
use storyledger_core::{
    registry::TypeDescriptor, ActorId, AggregateState, EntityId, EntityKind, FieldValue, ScopeId,
};
use storyledger_engine::{
    AppliedStory, AttributeBundle, ConflictSummary, Engine, EngineError, NewsItemBundle,
    Resolution, StoryBundle, Submission,
};
use storyledger_storage::ConflictRecord;
use tracing::{debug, error};

use crate::error::ApiError;
use crate::json::{
    aggregate_to_json, as_object, merge_state, parse_id, parse_version, snapshot_to_json,
    state_to_json, BASE_VERSION, ID,
};

const NEWS_ITEMS: &str = "news_items";
const ATTRIBUTES: &str = "attributes";
const KEY: &str = "key";

/// Attribute ids currently linked to one owner, by attribute key.
type LinkedByKey = BTreeMap<String, VecDeque<EntityId>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn from_error(err: &ApiError) -> Self {
        let status = err.status();
        if status >= 500 {
            error!(%err, "request failed");
        } else {
            debug!(status, %err, "request rejected");
        }
        let body = match err {
            ApiError::Engine(EngineError::ExternalConflict { conflicts }) => json!({
                "error": err.to_string(),
                "details": {
                    "errors": conflicts.iter().map(conflict_error).collect::<Vec<_>>(),
                },
            }),
            _ => json!({ "error": err.to_string() }),
        };
        Self { status, body }
    }
}

fn respond(result: Result<Value, ApiError>) -> ApiResponse {
    match result {
        Ok(body) => ApiResponse::ok(body),
        Err(err) => ApiResponse::from_error(&err),
    }
}

fn descriptor(engine: &Engine, kind: EntityKind) -> Result<&TypeDescriptor, ApiError> {
    Ok(engine.registry().get(kind).map_err(EngineError::from)?)
}

fn path_id(raw: &str) -> Result<EntityId, ApiError> {
    EntityId::parse(raw).map_err(|_| ApiError::BadRequest(format!("not a valid id: {raw}")))
}

fn conflict_error(conflict: &ConflictSummary) -> Value {
    let mut body = Map::new();
    body.insert("kind".into(), json!(conflict.kind.as_str()));
    body.insert("conflict_id".into(), json!(conflict.conflict_id.to_string()));
    body.insert("scope".into(), json!(conflict.scope_id.as_str()));
    body.insert("base_version".into(), json!(conflict.base_version));
    body.insert(
        "local".into(),
        state_to_json(Some(conflict.entity_id), Some(conflict.local_version), &conflict.local),
    );
    body.insert(
        "incoming".into(),
        state_to_json(Some(conflict.entity_id), None, &conflict.incoming),
    );
    if let Some(story_id) = conflict.incoming_story_id {
        body.insert("incoming_story_id".into(), json!(story_id.to_string()));
    }
    json!({ "conflict": Value::Object(body) })
}

// ============================================================================
// POST /worker/stories/{producer}
// ============================================================================

/// Accepts `[story, ...]` or `{"stories": [story, ...]}`.
pub fn push_stories(engine: &mut Engine, producer: &str, body: &Value) -> ApiResponse {
    respond(push_stories_inner(engine, producer, body))
}

fn push_stories_inner(engine: &mut Engine, producer: &str, body: &Value) -> Result<Value, ApiError> {
    let stories = match body {
        Value::Array(stories) => stories,
        Value::Object(object) => object
            .get("stories")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::BadRequest("expected a \"stories\" array".into()))?,
        _ => return Err(ApiError::BadRequest("expected a list of stories".into())),
    };
    if producer.is_empty() {
        return Err(ApiError::BadRequest("producer must not be empty".into()));
    }

    let bundles = stories
        .iter()
        .map(|story| parse_story(engine, story))
        .collect::<Result<Vec<_>, _>>()?;
    let submission = Submission {
        scope: ScopeId::new(producer),
        actor: ActorId::new(format!("worker:{producer}")),
        stories: bundles,
    };

    let applied = engine.submit(&submission)?;
    let stories = applied
        .iter()
        .map(|a| applied_story_json(engine, a))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "stories": stories }))
}

fn parse_story(engine: &Engine, value: &Value) -> Result<StoryBundle, ApiError> {
    let object = as_object(value, "story")?;
    let id = optional_id(object, "story id")?;
    let mut state = AggregateState::new();
    merge_state(
        descriptor(engine, EntityKind::Story)?,
        object,
        &[NEWS_ITEMS, ATTRIBUTES],
        &mut state,
    )?;

    let mut attributes = Vec::new();
    let links = parse_attribute_links(engine, id, object.get(ATTRIBUTES), &mut attributes)?;
    state.relations.insert(ATTRIBUTES.to_string(), links);

    let mut news_items = Vec::new();
    if let Some(items) = object.get(NEWS_ITEMS) {
        let items = items
            .as_array()
            .ok_or_else(|| ApiError::BadRequest("story.news_items must be an array".into()))?;
        for item in items {
            news_items.push(parse_news_item(engine, item, &mut attributes)?);
        }
    }

    Ok(StoryBundle {
        id,
        base_version: parse_version(object.get(BASE_VERSION))?,
        state,
        news_items,
        attributes,
    })
}

fn parse_news_item(
    engine: &Engine,
    value: &Value,
    attributes: &mut Vec<AttributeBundle>,
) -> Result<NewsItemBundle, ApiError> {
    let object = as_object(value, "news item")?;
    let id = optional_id(object, "news item id")?;
    let mut state = AggregateState::new();
    merge_state(
        descriptor(engine, EntityKind::NewsItem)?,
        object,
        &[ATTRIBUTES],
        &mut state,
    )?;
    let links = parse_attribute_links(engine, id, object.get(ATTRIBUTES), attributes)?;
    state.relations.insert(ATTRIBUTES.to_string(), links);

    Ok(NewsItemBundle {
        id,
        base_version: parse_version(object.get(BASE_VERSION))?,
        state,
    })
}

/// Attribute links are either bare ids or attribute objects to upsert.
///
/// An attribute object without an id takes the id of the attribute with the
/// same key already linked to `owner_id`, so re-pushing a payload does not
/// mint new attributes.
fn parse_attribute_links(
    engine: &Engine,
    owner_id: EntityId,
    value: Option<&Value>,
    attributes: &mut Vec<AttributeBundle>,
) -> Result<Vec<EntityId>, ApiError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let entries = value
        .as_array()
        .ok_or_else(|| ApiError::BadRequest("attributes must be an array".into()))?;

    let mut linked = linked_by_key(engine, owner_id)?;
    let mut links = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_string() {
            links.push(parse_id(entry, "attribute id")?);
            continue;
        }
        let object = as_object(entry, "attribute")?;
        let mut state = AggregateState::new();
        merge_state(descriptor(engine, EntityKind::Attribute)?, object, &[], &mut state)?;
        let id = match object.get(ID) {
            None | Some(Value::Null) => match state.field(KEY) {
                Some(FieldValue::Text(key)) => linked
                    .get_mut(key)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(EntityId::new),
                _ => EntityId::new(),
            },
            Some(value) => parse_id(value, "attribute id")?,
        };
        links.push(id);
        attributes.push(AttributeBundle {
            id,
            base_version: parse_version(object.get(BASE_VERSION))?,
            state,
        });
    }
    Ok(links)
}

fn linked_by_key(engine: &Engine, owner_id: EntityId) -> Result<LinkedByKey, ApiError> {
    let mut linked = LinkedByKey::new();
    let Some(owner) = engine.get_aggregate(owner_id)? else {
        return Ok(linked);
    };
    for member in owner.state.members(ATTRIBUTES) {
        let Some(attribute) = engine.get_aggregate(*member)? else {
            continue;
        };
        if let Some(FieldValue::Text(key)) = attribute.state.field(KEY) {
            linked.entry(key.clone()).or_default().push_back(*member);
        }
    }
    Ok(linked)
}

fn optional_id(object: &Map<String, Value>, what: &str) -> Result<EntityId, ApiError> {
    match object.get(ID) {
        None | Some(Value::Null) => Ok(EntityId::new()),
        Some(value) => parse_id(value, what),
    }
}

fn applied_story_json(engine: &Engine, applied: &AppliedStory) -> Result<Value, ApiError> {
    let story = engine.require_live(EntityKind::Story, applied.story.entity_id)?;
    let mut body = aggregate_to_json(&story);
    let items = story
        .state
        .members(NEWS_ITEMS)
        .iter()
        .map(|id| -> Result<Value, ApiError> {
            Ok(aggregate_to_json(&engine.require_live(EntityKind::NewsItem, *id)?))
        })
        .collect::<Result<Vec<_>, _>>()?;
    body[NEWS_ITEMS] = Value::Array(items);
    Ok(body)
}

// ============================================================================
// Conflict listing
// ============================================================================

/// GET /connectors/conflicts/stories
pub fn list_story_conflicts(engine: &Engine) -> ApiResponse {
    respond(list_conflicts(engine, EntityKind::Story))
}

/// GET /connectors/conflicts/news-items
pub fn list_news_item_conflicts(engine: &Engine) -> ApiResponse {
    respond(list_conflicts(engine, EntityKind::NewsItem))
}

/// GET /connectors/conflicts/attributes
pub fn list_attribute_conflicts(engine: &Engine) -> ApiResponse {
    respond(list_conflicts(engine, EntityKind::Attribute))
}

fn list_conflicts(engine: &Engine, kind: EntityKind) -> Result<Value, ApiError> {
    let conflicts: Vec<Value> = engine
        .list_conflicts(kind)?
        .iter()
        .map(conflict_record_json)
        .collect();
    Ok(json!({ "conflicts": conflicts }))
}

fn conflict_record_json(record: &ConflictRecord) -> Value {
    let original = state_to_json(Some(record.entity_id), None, &record.original);
    let updated = state_to_json(Some(record.entity_id), None, &record.incoming);
    let mut body = json!({
        "conflict_id": record.conflict_id.to_string(),
        "scope": record.scope_id.as_str(),
        "base_version": record.base_version,
        "current_version": record.current_version,
        "original": original,
        "updated": updated,
        "created_at": record.created_at,
        "updated_at": record.updated_at,
    });
    let id_key = match record.kind {
        EntityKind::Story => "storyId",
        EntityKind::NewsItem => "news_item_id",
        EntityKind::Attribute => "attribute_id",
    };
    body[id_key] = json!(record.entity_id.to_string());
    if let Some(parent) = &record.incoming_parent {
        body["incoming_story_id"] = json!(parent.story_id.to_string());
        body["incoming_story"] = state_to_json(Some(parent.story_id), None, &parent.story);
    }
    body
}

// ============================================================================
// Conflict resolution
// ============================================================================

/// PUT /connectors/conflicts/stories/{id}
pub fn resolve_story_conflict(
    engine: &mut Engine,
    story_id: &str,
    body: &Value,
    actor: &str,
) -> ApiResponse {
    respond(resolve(engine, EntityKind::Story, story_id, body, actor))
}

/// PUT /connectors/conflicts/news-items/{id}
pub fn resolve_news_item_conflict(
    engine: &mut Engine,
    news_item_id: &str,
    body: &Value,
    actor: &str,
) -> ApiResponse {
    respond(resolve(engine, EntityKind::NewsItem, news_item_id, body, actor))
}

/// PUT /connectors/conflicts/attributes/{id}
pub fn resolve_attribute_conflict(
    engine: &mut Engine,
    attribute_id: &str,
    body: &Value,
    actor: &str,
) -> ApiResponse {
    respond(resolve(engine, EntityKind::Attribute, attribute_id, body, actor))
}

fn resolve(
    engine: &mut Engine,
    kind: EntityKind,
    raw_id: &str,
    body: &Value,
    actor: &str,
) -> Result<Value, ApiError> {
    let entity_id = path_id(raw_id)?;
    let object = as_object(
        body.get("resolution")
            .ok_or_else(|| ApiError::BadRequest("missing \"resolution\"".into()))?,
        "resolution",
    )?;
    let mut chosen = AggregateState::new();
    merge_state(descriptor(engine, kind)?, object, &[], &mut chosen)?;
    let resolution = Resolution {
        fields: chosen.fields,
        relations: chosen.relations,
    };

    let actor = ActorId::new(actor);
    let resolved = match kind {
        EntityKind::Story => engine.resolve_story_conflict(entity_id, &resolution, actor)?,
        EntityKind::NewsItem => engine.resolve_news_item_conflict(entity_id, &resolution, actor)?,
        EntityKind::Attribute => engine.resolve_attribute_conflict(entity_id, &resolution, actor)?,
    };
    Ok(aggregate_to_json(&resolved.aggregate))
}

// ============================================================================
// GET /stories/{id}/history
// ============================================================================

pub fn story_history(engine: &Engine, story_id: &str) -> ApiResponse {
    respond(history(engine, story_id))
}

fn history(engine: &Engine, raw_id: &str) -> Result<Value, ApiError> {
    let story_id = path_id(raw_id)?;
    let snapshots = engine.history(EntityKind::Story, story_id)?;
    if snapshots.is_empty() {
        return Err(ApiError::NotFound(format!("story {story_id}")));
    }
    let history: Vec<Value> = snapshots.iter().map(snapshot_to_json).collect();
    Ok(json!({ "id": story_id.to_string(), "history": history }))
}
