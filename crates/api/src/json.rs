//! Conversion between aggregate states and their JSON representation.
//!
//! An aggregate is a flat JSON object: `id`, `version`, one key per field,
//! and one array of member ids per relation. Field values are typed by the
//! kind's descriptor, so `published: 1700000000000` becomes a timestamp.

use serde_json::{json, Map, Value};
use storyledger_core::{
    registry::{FieldSpec, TypeDescriptor},
    AggregateState, ChangeOrigin, EntityId, FieldKind, FieldValue, HistorySnapshot,
};
use storyledger_engine::Aggregate;

use crate::error::ApiError;

pub(crate) const ID: &str = "id";
pub(crate) const VERSION: &str = "version";
pub(crate) const BASE_VERSION: &str = "base_version";

pub fn field_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Text(s) => Value::String(s.clone()),
        FieldValue::Integer(i) | FieldValue::Timestamp(i) => json!(i),
        FieldValue::Float(f) => json!(f),
        FieldValue::Boolean(b) => Value::Bool(*b),
        FieldValue::EntityRef(id) => Value::String(id.to_string()),
    }
}

pub fn field_from_json(
    descriptor: &TypeDescriptor,
    spec: &FieldSpec,
    value: &Value,
) -> Result<FieldValue, ApiError> {
    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    let parsed = match spec.kind {
        FieldKind::Text => value.as_str().map(|s| FieldValue::Text(s.to_string())),
        FieldKind::Integer => value.as_i64().map(FieldValue::Integer),
        FieldKind::Float => value.as_f64().map(FieldValue::Float),
        FieldKind::Boolean => value.as_bool().map(FieldValue::Boolean),
        FieldKind::Timestamp => value.as_i64().map(FieldValue::Timestamp),
        FieldKind::EntityRef => value
            .as_str()
            .and_then(|s| EntityId::parse(s).ok())
            .map(FieldValue::EntityRef),
    };
    parsed.ok_or_else(|| {
        ApiError::BadRequest(format!(
            "{}.{} expects {}, got {value}",
            descriptor.kind,
            spec.name,
            spec.kind.as_str()
        ))
    })
}

pub fn parse_id(value: &Value, what: &str) -> Result<EntityId, ApiError> {
    value
        .as_str()
        .and_then(|s| EntityId::parse(s).ok())
        .ok_or_else(|| ApiError::BadRequest(format!("{what} is not a valid id: {value}")))
}

pub fn parse_version(value: Option<&Value>) -> Result<Option<u64>, ApiError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("{BASE_VERSION} must be a version number, got {v}"))),
    }
}

pub fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ApiError> {
    value
        .as_object()
        .ok_or_else(|| ApiError::BadRequest(format!("{what} must be a JSON object")))
}

/// Read the fields and relations named in `object` into `state`.
///
/// Keys listed in `skip` are handled by the caller. Any other key the
/// descriptor does not know is rejected. Relations are arrays of ids.
pub fn merge_state(
    descriptor: &TypeDescriptor,
    object: &Map<String, Value>,
    skip: &[&str],
    state: &mut AggregateState,
) -> Result<(), ApiError> {
    for (key, value) in object {
        if key == ID || key == VERSION || key == BASE_VERSION || skip.contains(&key.as_str()) {
            continue;
        }
        if let Some(spec) = descriptor.field(key) {
            state
                .fields
                .insert(key.clone(), field_from_json(descriptor, spec, value)?);
        } else if descriptor.relation(key).is_some() {
            let items = value.as_array().ok_or_else(|| {
                ApiError::BadRequest(format!("{}.{key} must be an array of ids", descriptor.kind))
            })?;
            let members = items
                .iter()
                .map(|v| parse_id(v, key))
                .collect::<Result<Vec<_>, _>>()?;
            state.relations.insert(key.clone(), members);
        } else {
            return Err(ApiError::BadRequest(format!(
                "{} has no field or relation '{key}'",
                descriptor.kind
            )));
        }
    }
    Ok(())
}

pub fn state_to_json(id: Option<EntityId>, version: Option<u64>, state: &AggregateState) -> Value {
    let mut object = Map::new();
    if let Some(id) = id {
        object.insert(ID.into(), Value::String(id.to_string()));
    }
    if let Some(version) = version {
        object.insert(VERSION.into(), json!(version));
    }
    for (name, value) in &state.fields {
        object.insert(name.clone(), field_to_json(value));
    }
    for (name, members) in &state.relations {
        object.insert(
            name.clone(),
            Value::Array(members.iter().map(|m| Value::String(m.to_string())).collect()),
        );
    }
    Value::Object(object)
}

pub fn aggregate_to_json(aggregate: &Aggregate) -> Value {
    state_to_json(
        Some(aggregate.entity_id),
        Some(aggregate.version),
        &aggregate.state,
    )
}

pub fn origin_to_json(origin: &ChangeOrigin) -> Value {
    match origin {
        ChangeOrigin::Local => json!({ "type": "local" }),
        ChangeOrigin::External(scope) => json!({ "type": "external", "scope": scope.as_str() }),
        ChangeOrigin::Resolution(conflict_id) => {
            json!({ "type": "resolution", "conflict_id": conflict_id.to_string() })
        }
    }
}

pub fn snapshot_to_json(snapshot: &HistorySnapshot) -> Value {
    let fields: Map<String, Value> = snapshot
        .fields
        .iter()
        .map(|(name, value)| (name.clone(), field_to_json(value)))
        .collect();
    let relations: Map<String, Value> = snapshot
        .relations
        .iter()
        .map(|(name, members)| {
            let members = members
                .iter()
                .map(|m| json!({ "id": m.entity_id.to_string(), "version": m.version }))
                .collect();
            (name.clone(), Value::Array(members))
        })
        .collect();
    json!({
        "version": snapshot.version,
        "changed_at": snapshot.changed_at,
        "changed_by": snapshot.changed_by.as_str(),
        "origin": origin_to_json(&snapshot.origin),
        "change": snapshot.change.as_str(),
        "fields": fields,
        "relations": relations,
    })
}
