use storyledger_core::{AggregateState, ChangeKind, EntityId, EntityKind, FieldValue, MemberRef};
use storyledger_engine::EngineError;
use storyledger_harness::TestStore;

// ============================================================================
// Version counter and history writer
// ============================================================================

#[test]
fn create_starts_at_version_one() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let story = store.create_story("Flood warning", vec![], vec![])?;

    assert_eq!(store.version(story)?, 1);
    let history = store.engine.history(EntityKind::Story, story)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 1);
    assert_eq!(history[0].change, ChangeKind::Created);
    assert_eq!(history[0].changed_by.as_str(), "editor");
    assert_eq!(
        history[0].fields.get("title"),
        Some(&FieldValue::Text("Flood warning".into()))
    );
    Ok(())
}

#[test]
fn versions_are_gapless_and_monotonic() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let story = store.create_story("Draft", vec![], vec![])?;

    for i in 0..5 {
        let outcome = store.edit_field(EntityKind::Story, story, "title", format!("Draft {i}"))?;
        assert_eq!(outcome.version, i + 2);
    }

    let versions: Vec<u64> = store
        .engine
        .history(EntityKind::Story, story)?
        .iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(store.version(story)?, 6);
    Ok(())
}

#[test]
fn one_snapshot_per_logical_change() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let tag = store.create_attribute("region", "north")?;
    let story = store.create_story("Storm", vec![], vec![])?;

    // Several field edits plus a relation edit, committed once.
    let editor = store.editor.clone();
    let outcome = store.engine.modify(EntityKind::Story, story, &editor, |state| {
        state.set_field("title", "Storm update");
        state.set_field("summary", "Winds up to 120 km/h");
        state.set_field("important", true);
        state.relations.insert("attributes".into(), vec![tag]);
    })?;

    assert_eq!(outcome.version, 2);
    assert_eq!(outcome.change.kind, ChangeKind::FieldChange);
    assert_eq!(
        outcome.change.changed_fields,
        vec!["important".to_string(), "summary".to_string(), "title".to_string()]
    );
    assert_eq!(outcome.change.relation("attributes").map(|d| d.added.clone()), Some(vec![tag]));
    assert_eq!(store.engine.history(EntityKind::Story, story)?.len(), 2);
    Ok(())
}

#[test]
fn unchanged_state_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let story = store.create_story("Quiet day", vec![], vec![])?;
    let current = store.engine.require_live(EntityKind::Story, story)?;

    let editor = store.editor.clone();
    let outcome = store
        .engine
        .commit_change(EntityKind::Story, story, Some(current.state.clone()), &editor)?;
    assert!(outcome.is_noop());
    assert_eq!(outcome.version, 1);

    // An explicit null equals an absent field; an empty relation equals no relation.
    let padded = current
        .state
        .with_field("summary", FieldValue::Null)
        .with_members("attributes", vec![]);
    let outcome = store
        .engine
        .commit_change(EntityKind::Story, story, Some(padded), &editor)?;
    assert!(outcome.is_noop());

    assert_eq!(store.version(story)?, 1);
    assert_eq!(store.engine.history(EntityKind::Story, story)?.len(), 1);
    Ok(())
}

#[test]
fn membership_only_change_is_a_relation_change() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let first = store.create_news_item("First report", vec![])?;
    let second = store.create_news_item("Second report", vec![])?;
    let story = store.create_story("Fire", vec![first], vec![])?;

    let editor = store.editor.clone();
    let outcome = store.engine.modify(EntityKind::Story, story, &editor, |state| {
        state.relations.insert("news_items".into(), vec![second, first]);
    })?;
    assert_eq!(outcome.change.kind, ChangeKind::RelationChange);
    assert!(outcome.change.changed_fields.is_empty());

    // Reordering an unordered relation is not a change.
    let outcome = store.engine.modify(EntityKind::Story, story, &editor, |state| {
        state.relations.insert("news_items".into(), vec![first, second]);
    })?;
    assert!(outcome.is_noop());
    assert_eq!(store.version(story)?, 2);
    Ok(())
}

#[test]
fn snapshot_at_returns_point_in_time_state() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let story = store.create_story("v1 title", vec![], vec![])?;
    store.edit_field(EntityKind::Story, story, "title", "v2 title")?;

    let first = store
        .engine
        .snapshot_at(EntityKind::Story, story, 1)?
        .ok_or("missing snapshot")?;
    assert_eq!(first.state().field("title"), Some(&FieldValue::Text("v1 title".into())));
    assert!(store.engine.snapshot_at(EntityKind::Story, story, 3)?.is_none());
    Ok(())
}

// ============================================================================
// Delete and identity
// ============================================================================

#[test]
fn delete_records_final_snapshot() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let item = store.create_news_item("Retracted", vec![])?;

    let editor = store.editor.clone();
    let outcome = store.engine.delete(EntityKind::NewsItem, item, &editor)?;
    assert_eq!(outcome.version, 2);
    assert_eq!(outcome.change.kind, ChangeKind::Deleted);
    assert!(store.engine.get_aggregate(item)?.is_none());

    let history = store.engine.history(EntityKind::NewsItem, item)?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].change, ChangeKind::Deleted);
    assert_eq!(
        history[1].fields.get("title"),
        Some(&FieldValue::Text("Retracted".into()))
    );
    Ok(())
}

#[test]
fn deleted_ids_are_never_reused() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let item = store.create_news_item("Gone", vec![])?;
    let editor = store.editor.clone();
    store.engine.delete(EntityKind::NewsItem, item, &editor)?;

    let again = AggregateState::new().with_field("title", "Back again");
    let result = store
        .engine
        .commit_change(EntityKind::NewsItem, item, Some(again), &editor);
    assert!(matches!(result, Err(EngineError::EntityDeleted(_))));

    let result = store.engine.delete(EntityKind::NewsItem, item, &editor);
    assert!(matches!(result, Err(EngineError::EntityDeleted(_))));
    assert_eq!(store.engine.history(EntityKind::NewsItem, item)?.len(), 2);
    Ok(())
}

#[test]
fn deleting_unknown_entity_fails() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let editor = store.editor.clone();
    let result = store.engine.delete(EntityKind::Story, EntityId::new(), &editor);
    assert!(matches!(result, Err(EngineError::EntityNotFound(_))));
    Ok(())
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn invalid_state_is_rejected_without_writes() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let editor = store.editor.clone();

    let untitled = AggregateState::new().with_field("summary", "no title");
    let result = store.engine.create(EntityKind::Story, untitled, &editor);
    assert!(matches!(result, Err(EngineError::Validation(_))));

    let mistyped = AggregateState::new()
        .with_field("title", "Typed")
        .with_field("relevance", "very");
    let result = store.engine.create(EntityKind::Story, mistyped, &editor);
    assert!(matches!(result, Err(EngineError::Validation(_))));

    assert!(store.engine.list(EntityKind::Story)?.is_empty());
    Ok(())
}

#[test]
fn members_must_match_relation_target() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let other_story = store.create_story("Not an item", vec![], vec![])?;

    let editor = store.editor.clone();
    let state = AggregateState::new()
        .with_field("title", "Wrong members")
        .with_members("news_items", vec![other_story]);
    let result = store.engine.create(EntityKind::Story, state, &editor);
    assert!(matches!(result, Err(EngineError::Validation(_))));
    Ok(())
}

#[test]
fn editing_with_wrong_kind_fails() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let item = store.create_news_item("An item", vec![])?;
    let result = store.edit_field(EntityKind::Story, item, "title", "as story");
    assert!(matches!(
        result,
        Err(EngineError::KindMismatch {
            expected: EntityKind::Story,
            actual: EntityKind::NewsItem,
            ..
        })
    ));
    Ok(())
}

// ============================================================================
// Join history
// ============================================================================

#[test]
fn join_rows_keep_parent_versions_at_link_time() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let tag = store.create_attribute("topic", "weather")?;
    let story = store.create_story("Heatwave", vec![], vec![tag])?;

    // Both parents advance after the link was made.
    store.edit_field(EntityKind::Attribute, tag, "value", "climate")?;
    store.edit_field(EntityKind::Attribute, tag, "description", "renamed")?;
    store.edit_field(EntityKind::Story, story, "title", "Heatwave, day 3")?;
    assert_eq!(store.version(tag)?, 3);
    assert_eq!(store.version(story)?, 2);

    let rows = store
        .engine
        .join_history(EntityKind::Story, "attributes", story, tag)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].owner_version, 1);
    assert_eq!(rows[0].member_version, 1);
    assert!(rows[0].linked);

    // Unlinking records the versions current at unlink time.
    let editor = store.editor.clone();
    store.engine.modify(EntityKind::Story, story, &editor, |state| {
        state.relations.remove("attributes");
    })?;
    let rows = store
        .engine
        .join_history(EntityKind::Story, "attributes", story, tag)?;
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[1].owner_version, rows[1].member_version), (3, 3));
    assert!(!rows[1].linked);

    assert_eq!(
        store.engine.members_at(EntityKind::Story, story, "attributes", 2)?,
        vec![MemberRef { entity_id: tag, version: Some(1) }]
    );
    assert!(
        store
            .engine
            .members_at(EntityKind::Story, story, "attributes", 3)?
            .is_empty()
    );
    Ok(())
}

#[test]
fn news_item_attribute_links_are_versioned() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let lang = store.create_attribute("language", "en")?;
    let item = store.create_news_item("Report", vec![])?;

    let editor = store.editor.clone();
    store.engine.modify(EntityKind::NewsItem, item, &editor, |state| {
        state.relations.insert("attributes".into(), vec![lang]);
    })?;

    let rows = store
        .engine
        .join_history(EntityKind::NewsItem, "attributes", item, lang)?;
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].owner_version, rows[0].member_version), (2, 1));
    assert!(
        store
            .engine
            .members_at(EntityKind::NewsItem, item, "attributes", 1)?
            .is_empty()
    );
    Ok(())
}

#[test]
fn unresolvable_parent_skips_join_row() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let missing = EntityId::new();

    let editor = store.editor.clone();
    let state = AggregateState::new()
        .with_field("title", "Dangling")
        .with_members("attributes", vec![missing]);
    let outcome = store.engine.create(EntityKind::Story, state, &editor)?;

    assert_eq!(outcome.skipped_joins.len(), 1);
    assert_eq!(outcome.skipped_joins[0].member_id, missing);
    assert!(
        store
            .engine
            .join_history(EntityKind::Story, "attributes", outcome.entity_id, missing)?
            .is_empty()
    );

    let snapshot = store
        .engine
        .snapshot_at(EntityKind::Story, outcome.entity_id, 1)?
        .ok_or("missing snapshot")?;
    assert_eq!(
        snapshot.relations.get("attributes"),
        Some(&vec![MemberRef { entity_id: missing, version: None }])
    );
    Ok(())
}

#[test]
fn news_items_relation_has_no_join_history() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let item = store.create_news_item("Item", vec![])?;
    let story = store.create_story("Story", vec![item], vec![])?;

    let result = store
        .engine
        .join_history(EntityKind::Story, "news_items", story, item);
    assert!(matches!(result, Err(EngineError::Validation(_))));

    let snapshot = store
        .engine
        .snapshot_at(EntityKind::Story, story, 1)?
        .ok_or("missing snapshot")?;
    assert_eq!(
        snapshot.relations.get("news_items"),
        Some(&vec![MemberRef { entity_id: item, version: Some(1) }])
    );
    Ok(())
}
