use storyledger_core::{
    ActorId, AggregateState, ChangeKind, ChangeOrigin, EntityId, EntityKind, FieldValue, ScopeId,
};
use storyledger_engine::{
    AppliedStory, ConflictSummary, EngineError, NewsItemBundle, Resolution, StoryBundle,
};
use storyledger_harness::TestStore;

fn text(s: &str) -> FieldValue {
    FieldValue::Text(s.into())
}

/// Story at version 2 locally while a producer still holds version 1.
fn stale_story(store: &mut TestStore) -> Result<(EntityId, StoryBundle), Box<dyn std::error::Error>> {
    let story = store.create_story("Original title", vec![], vec![])?;
    let bundle = store.story_bundle(story)?;
    store.edit_field(EntityKind::Story, story, "title", "Editor title")?;
    Ok((story, bundle))
}

fn expect_conflicts(result: Result<Vec<AppliedStory>, EngineError>) -> Vec<ConflictSummary> {
    match result {
        Err(EngineError::ExternalConflict { conflicts }) => conflicts,
        other => panic!("expected an external conflict, got {other:?}"),
    }
}

fn with_title(mut bundle: StoryBundle, title: &str) -> StoryBundle {
    bundle.state.set_field("title", title);
    bundle
}

// ============================================================================
// Detection
// ============================================================================

#[test]
fn stale_submission_is_rejected_and_recorded() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, bundle) = stale_story(&mut store)?;

    let result = store.submit("worker-rss", vec![with_title(bundle, "Producer title")]);
    let conflicts = expect_conflicts(result);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, EntityKind::Story);
    assert_eq!(conflicts[0].entity_id, story);
    assert_eq!(conflicts[0].local_version, 2);
    assert_eq!(conflicts[0].base_version, Some(1));
    assert_eq!(conflicts[0].local.field("title"), Some(&text("Editor title")));
    assert_eq!(conflicts[0].incoming.field("title"), Some(&text("Producer title")));

    // The aggregate is untouched.
    assert_eq!(store.version(story)?, 2);
    assert_eq!(store.field(story, "title")?, text("Editor title"));
    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 1);
    Ok(())
}

#[test]
fn matching_base_is_applied() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let story = store.create_story("Original title", vec![], vec![])?;
    let bundle = with_title(store.story_bundle(story)?, "Producer title");

    let applied = store.submit("worker-rss", vec![bundle])?;
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].story.version, 2);
    assert_eq!(store.field(story, "title")?, text("Producer title"));

    let history = store.engine.history(EntityKind::Story, story)?;
    assert_eq!(history[1].changed_by.as_str(), "worker-rss");
    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 0);
    Ok(())
}

#[test]
fn stale_base_without_material_change_is_not_a_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, bundle) = stale_story(&mut store)?;

    // The producer's proposal already equals the local state.
    let applied = store.submit("worker-rss", vec![with_title(bundle, "Editor title")])?;
    assert!(applied[0].story.is_noop());
    assert_eq!(store.version(story)?, 2);
    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 0);
    Ok(())
}

#[test]
fn new_stories_from_producer_are_created() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let item_id = EntityId::new();
    let bundle = StoryBundle {
        id: EntityId::new(),
        base_version: None,
        state: AggregateState::new().with_field("title", "Fresh"),
        news_items: vec![NewsItemBundle {
            id: item_id,
            base_version: None,
            state: AggregateState::new().with_field("title", "Wire copy"),
        }],
        attributes: vec![],
    };
    let story_id = bundle.id;

    let applied = store.submit("worker-rss", vec![bundle])?;
    assert_eq!(applied[0].story.change.kind, ChangeKind::Created);
    assert_eq!(applied[0].news_items[0].change.kind, ChangeKind::Created);

    let story = store.engine.require_live(EntityKind::Story, story_id)?;
    assert_eq!(story.version, 1);
    assert_eq!(story.state.members("news_items"), &[item_id]);
    Ok(())
}

// ============================================================================
// Refresh and idempotence
// ============================================================================

#[test]
fn resubmission_refreshes_without_duplicating() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, bundle) = stale_story(&mut store)?;

    let first = store.submit("worker-rss", vec![with_title(bundle.clone(), "Producer v1")]);
    assert!(matches!(first, Err(EngineError::ExternalConflict { .. })));
    let recorded = store.engine.conflicts_for_entity(EntityKind::Story, story)?;
    assert_eq!(recorded.len(), 1);

    let second = store.submit("worker-rss", vec![with_title(bundle, "Producer v2")]);
    assert!(matches!(second, Err(EngineError::ExternalConflict { .. })));

    let refreshed = store.engine.conflicts_for_entity(EntityKind::Story, story)?;
    assert_eq!(refreshed.len(), 1);
    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 1);
    assert_eq!(refreshed[0].conflict_id, recorded[0].conflict_id);
    assert_eq!(refreshed[0].incoming.field("title"), Some(&text("Producer v2")));
    assert_eq!(refreshed[0].original, recorded[0].original);
    assert_eq!(refreshed[0].original.field("title"), Some(&text("Editor title")));
    Ok(())
}

#[test]
fn identical_resubmission_changes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, bundle) = stale_story(&mut store)?;
    let bundle = with_title(bundle, "Producer title");

    assert!(store.submit("worker-rss", vec![bundle.clone()]).is_err());
    let before = store.engine.conflicts_for_entity(EntityKind::Story, story)?;
    assert!(store.submit("worker-rss", vec![bundle]).is_err());
    let after = store.engine.conflicts_for_entity(EntityKind::Story, story)?;

    assert_eq!(before, after);
    Ok(())
}

#[test]
fn reordered_or_null_padded_resubmission_is_identical() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let region = store.create_attribute("region", "north")?;
    let topic = store.create_attribute("topic", "weather")?;
    let story = store.create_story("Original title", vec![], vec![region, topic])?;
    let bundle = with_title(store.story_bundle(story)?, "Producer title");
    store.edit_field(EntityKind::Story, story, "title", "Editor title")?;

    assert!(store.submit("worker-rss", vec![bundle.clone()]).is_err());
    let before = store.engine.conflicts_for_entity(EntityKind::Story, story)?;

    let mut reordered = bundle;
    reordered.state.relations.insert("attributes".into(), vec![topic, region]);
    reordered.state.set_field("summary", FieldValue::Null);
    assert!(store.submit("worker-rss", vec![reordered]).is_err());

    let after = store.engine.conflicts_for_entity(EntityKind::Story, story)?;
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn another_scope_refreshes_the_pending_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, bundle) = stale_story(&mut store)?;

    assert!(store.submit("worker-rss", vec![with_title(bundle.clone(), "From RSS")]).is_err());
    let first = store.engine.conflicts_for_entity(EntityKind::Story, story)?;
    assert!(store.submit("worker-email", vec![with_title(bundle.clone(), "From email")]).is_err());

    let records = store.engine.conflicts_for_entity(EntityKind::Story, story)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].conflict_id, first[0].conflict_id);
    assert_eq!(records[0].scope_id, ScopeId::new("worker-email"));
    assert_eq!(records[0].incoming.field("title"), Some(&text("From email")));
    assert_eq!(records[0].original, first[0].original);

    // The RSS worker catching up does not clear a conflict the email worker now holds.
    store.submit("worker-rss", vec![with_title(bundle, "Editor title")])?;
    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 1);
    Ok(())
}

// ============================================================================
// Clearing
// ============================================================================

#[test]
fn rebased_submission_clears_story_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, bundle) = stale_story(&mut store)?;
    assert!(store.submit("worker-rss", vec![with_title(bundle, "Producer title")]).is_err());

    let rebased = with_title(store.story_bundle(story)?, "Producer title");
    store.submit("worker-rss", vec![rebased])?;

    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 0);
    assert_eq!(store.version(story)?, 3);
    assert_eq!(store.field(story, "title")?, text("Producer title"));
    Ok(())
}

#[test]
fn dropping_an_item_clears_only_its_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let a = store.create_news_item("Item A", vec![])?;
    let b = store.create_news_item("Item B", vec![])?;
    let story = store.create_story("Two items", vec![a, b], vec![])?;

    let mut bundle = store.story_bundle(story)?;
    store.edit_field(EntityKind::NewsItem, a, "title", "Item A, edited")?;
    store.edit_field(EntityKind::NewsItem, b, "title", "Item B, edited")?;
    for item in &mut bundle.news_items {
        item.state.set_field("content", "producer body");
    }

    let result = store.submit("worker-rss", vec![bundle.clone()]);
    let conflicts = expect_conflicts(result);
    assert_eq!(conflicts.len(), 2);
    assert!(conflicts.iter().all(|c| c.kind == EntityKind::NewsItem));
    assert!(conflicts.iter().all(|c| c.incoming_story_id == Some(story)));
    assert_eq!(store.engine.conflict_count(EntityKind::NewsItem)?, 2);
    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 0);

    // The producer stops sending item A.
    bundle.news_items.retain(|item| item.id != a);
    let result = store.submit("worker-rss", vec![bundle]);
    let conflicts = expect_conflicts(result);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].entity_id, b);

    let remaining = store.engine.list_conflicts(EntityKind::NewsItem)?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].entity_id, b);
    assert_eq!(store.field(a, "title")?, text("Item A, edited"));
    assert_eq!(store.version(story)?, 1);
    Ok(())
}

#[test]
fn batch_is_all_or_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (stale, stale_bundle) = stale_story(&mut store)?;
    let clean = store.create_story("Clean story", vec![], vec![])?;
    let clean_bundle = with_title(store.story_bundle(clean)?, "Clean story, updated");

    let result = store.submit(
        "worker-rss",
        vec![with_title(stale_bundle, "Producer title"), clean_bundle],
    );
    let conflicts = expect_conflicts(result);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].entity_id, stale);

    assert_eq!(store.version(clean)?, 1);
    assert_eq!(store.field(clean, "title")?, text("Clean story"));
    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 1);
    Ok(())
}

#[test]
fn items_move_between_stories() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let item = store.create_news_item("Shared report", vec![])?;
    let old_story = store.create_story("Old grouping", vec![item], vec![])?;

    let new_story = EntityId::new();
    let item_bundle = store.story_bundle(old_story)?.news_items;
    store.submit(
        "worker-grouping",
        vec![StoryBundle {
            id: new_story,
            base_version: None,
            state: AggregateState::new().with_field("title", "New grouping"),
            news_items: item_bundle,
            attributes: vec![],
        }],
    )?;

    let old = store.engine.require_live(EntityKind::Story, old_story)?;
    assert!(old.state.members("news_items").is_empty());
    assert_eq!(old.version, 2);
    let new = store.engine.require_live(EntityKind::Story, new_story)?;
    assert_eq!(new.state.members("news_items"), &[item]);
    Ok(())
}

// ============================================================================
// Attributes
// ============================================================================

/// Story linking one attribute, a producer bundle carrying that attribute,
/// and a human edit to the attribute made after the producer read it.
fn stale_attribute(
    store: &mut TestStore,
) -> Result<(EntityId, EntityId, StoryBundle), Box<dyn std::error::Error>> {
    let tlp = store.create_attribute("tlp", "amber")?;
    let story = store.create_story("Leak report", vec![], vec![tlp])?;
    let mut bundle = store.story_bundle(story)?;
    bundle.attributes.push(store.attribute_bundle(tlp)?);
    store.edit_field(EntityKind::Attribute, tlp, "value", "red")?;
    Ok((story, tlp, bundle))
}

#[test]
fn stale_attribute_is_a_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, tlp, mut bundle) = stale_attribute(&mut store)?;
    bundle.attributes[0].state.set_field("value", "amber-producer");

    let conflicts = expect_conflicts(store.submit("worker-rss", vec![bundle]));
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, EntityKind::Attribute);
    assert_eq!(conflicts[0].entity_id, tlp);
    assert_eq!(conflicts[0].incoming_story_id, Some(story));
    assert_eq!(conflicts[0].local.field("value"), Some(&text("red")));
    assert_eq!(conflicts[0].incoming.field("value"), Some(&text("amber-producer")));

    // The human edit survives.
    assert_eq!(store.field(tlp, "value")?, text("red"));
    assert_eq!(store.version(tlp)?, 2);
    assert_eq!(store.version(story)?, 1);
    assert_eq!(store.engine.conflict_count(EntityKind::Attribute)?, 1);
    Ok(())
}

#[test]
fn attribute_with_current_base_is_applied() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, tlp, _) = stale_attribute(&mut store)?;
    let mut bundle = store.story_bundle(story)?;
    let mut attribute = store.attribute_bundle(tlp)?;
    attribute.state.set_field("description", "traffic light protocol");
    bundle.attributes.push(attribute);

    let applied = store.submit("worker-rss", vec![bundle])?;
    assert_eq!(applied[0].attributes[0].version, 3);
    assert_eq!(store.field(tlp, "value")?, text("red"));
    assert_eq!(store.field(tlp, "description")?, text("traffic light protocol"));
    Ok(())
}

#[test]
fn dropping_an_attribute_clears_its_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, tlp, mut bundle) = stale_attribute(&mut store)?;
    bundle.attributes[0].state.set_field("value", "amber-producer");
    assert!(store.submit("worker-rss", vec![bundle.clone()]).is_err());

    bundle.attributes.clear();
    store.submit("worker-rss", vec![bundle])?;
    assert_eq!(store.engine.conflict_count(EntityKind::Attribute)?, 0);
    assert_eq!(store.field(tlp, "value")?, text("red"));
    assert_eq!(store.version(story)?, 1);
    Ok(())
}

#[test]
fn attribute_resolution_keeps_chosen_value() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (_, tlp, mut bundle) = stale_attribute(&mut store)?;
    bundle.attributes[0].state.set_field("value", "amber-producer");
    assert!(store.submit("worker-rss", vec![bundle]).is_err());

    let resolved = store.engine.resolve_attribute_conflict(
        tlp,
        &Resolution::new().with_field("value", "amber"),
        ActorId::new("desk-editor"),
    )?;
    assert_eq!(resolved.aggregate.version, 3);
    assert_eq!(resolved.cleared, 1);
    assert_eq!(store.field(tlp, "value")?, text("amber"));
    assert_eq!(store.engine.conflict_count(EntityKind::Attribute)?, 0);
    Ok(())
}

// ============================================================================
// Resolution
// ============================================================================

#[test]
fn resolution_advances_version_and_clears_conflicts() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, bundle) = stale_story(&mut store)?;
    assert!(store.submit("worker-rss", vec![with_title(bundle.clone(), "From RSS")]).is_err());
    assert!(store.submit("worker-email", vec![with_title(bundle, "From email")]).is_err());
    let conflict_id = store.engine.conflicts_for_entity(EntityKind::Story, story)?[0].conflict_id;

    let resolution = Resolution::new()
        .with_field("title", "Merged title")
        .with_field("important", true);
    let resolved = store
        .engine
        .resolve_story_conflict(story, &resolution, ActorId::new("desk-editor"))?;

    assert_eq!(resolved.aggregate.version, 3);
    assert_eq!(resolved.cleared, 1);
    assert_eq!(resolved.aggregate.state.field("title"), Some(&text("Merged title")));
    assert_eq!(
        resolved.aggregate.state.field("important"),
        Some(&FieldValue::Boolean(true))
    );
    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 0);

    let history = store.engine.history(EntityKind::Story, story)?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].changed_by.as_str(), "desk-editor");
    assert_eq!(history[2].change, ChangeKind::FieldChange);
    assert_eq!(history[2].origin, ChangeOrigin::Resolution(conflict_id));
    assert_eq!(history[1].origin, ChangeOrigin::Local);
    Ok(())
}

#[test]
fn news_item_resolution_clears_only_that_item() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let a = store.create_news_item("Item A", vec![])?;
    let b = store.create_news_item("Item B", vec![])?;
    let story = store.create_story("Two items", vec![a, b], vec![])?;

    let mut bundle = store.story_bundle(story)?;
    store.edit_field(EntityKind::NewsItem, a, "review", "checked")?;
    store.edit_field(EntityKind::NewsItem, b, "review", "checked")?;
    for item in &mut bundle.news_items {
        item.state.set_field("review", "machine");
    }
    assert!(store.submit("worker-rss", vec![bundle]).is_err());
    assert_eq!(store.engine.conflict_count(EntityKind::NewsItem)?, 2);

    let resolved = store.engine.resolve_news_item_conflict(
        a,
        &Resolution::new().with_field("review", "machine, checked"),
        ActorId::new("desk-editor"),
    )?;
    assert_eq!(resolved.aggregate.version, 3);
    assert_eq!(resolved.cleared, 1);

    let remaining = store.engine.list_conflicts(EntityKind::NewsItem)?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].entity_id, b);
    Ok(())
}

#[test]
fn resolving_without_pending_conflict_fails() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let story = store.create_story("Calm", vec![], vec![])?;

    let result = store.engine.resolve_story_conflict(
        story,
        &Resolution::new().with_field("title", "Anything"),
        ActorId::new("desk-editor"),
    );
    assert!(matches!(result, Err(EngineError::ConflictNotFound(_))));
    assert_eq!(store.version(story)?, 1);
    Ok(())
}

#[test]
fn invalid_resolution_keeps_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let (story, bundle) = stale_story(&mut store)?;
    assert!(store.submit("worker-rss", vec![with_title(bundle, "From RSS")]).is_err());

    let result = store.engine.resolve_story_conflict(
        story,
        &Resolution::new().with_field("title", FieldValue::Null),
        ActorId::new("desk-editor"),
    );
    assert!(matches!(result, Err(EngineError::Validation(_))));

    let result = store.engine.resolve_story_conflict(
        story,
        &Resolution::new().with_field("headline", "unknown field"),
        ActorId::new("desk-editor"),
    );
    assert!(matches!(result, Err(EngineError::Validation(_))));

    assert_eq!(store.version(story)?, 2);
    assert_eq!(store.engine.conflict_count(EntityKind::Story)?, 1);
    Ok(())
}
