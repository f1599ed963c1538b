use storyledger_core::{
    ActorId, AggregateState, ChangeContext, EntityId, EntityKind, FieldValue, ScopeId,
};
use storyledger_engine::{
    AppliedStory, AttributeBundle, CommitOutcome, Engine, EngineError, NewsItemBundle,
    StoryBundle, Submission,
};

pub struct TestStore {
    pub engine: Engine,
    pub editor: ChangeContext,
}

impl TestStore {
    pub fn new() -> Result<Self, EngineError> {
        crate::init_logging();
        Ok(Self::with_engine(Engine::open_in_memory()?))
    }

    pub fn with_engine(engine: Engine) -> Self {
        Self {
            engine,
            editor: ChangeContext::local("editor"),
        }
    }

    pub fn create_attribute(&mut self, key: &str, value: &str) -> Result<EntityId, EngineError> {
        let state = AggregateState::new()
            .with_field("key", key)
            .with_field("value", value);
        let outcome = self.engine.create(EntityKind::Attribute, state, &self.editor)?;
        Ok(outcome.entity_id)
    }

    pub fn create_news_item(
        &mut self,
        title: &str,
        attributes: Vec<EntityId>,
    ) -> Result<EntityId, EngineError> {
        let state = AggregateState::new()
            .with_field("title", title)
            .with_members("attributes", attributes);
        let outcome = self.engine.create(EntityKind::NewsItem, state, &self.editor)?;
        Ok(outcome.entity_id)
    }

    pub fn create_story(
        &mut self,
        title: &str,
        news_items: Vec<EntityId>,
        attributes: Vec<EntityId>,
    ) -> Result<EntityId, EngineError> {
        let state = AggregateState::new()
            .with_field("title", title)
            .with_members("news_items", news_items)
            .with_members("attributes", attributes);
        let outcome = self.engine.create(EntityKind::Story, state, &self.editor)?;
        Ok(outcome.entity_id)
    }

    /// Interactive edit of a single field.
    pub fn edit_field(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<CommitOutcome, EngineError> {
        let value = value.into();
        self.engine
            .modify(kind, entity_id, &self.editor, |state| state.set_field(field, value))
    }

    pub fn version(&self, entity_id: EntityId) -> Result<u64, EngineError> {
        Ok(self
            .engine
            .get_aggregate(entity_id)?
            .ok_or_else(|| EngineError::EntityNotFound(entity_id.to_string()))?
            .version)
    }

    pub fn field(&self, entity_id: EntityId, field: &str) -> Result<FieldValue, EngineError> {
        Ok(self
            .engine
            .get_aggregate(entity_id)?
            .and_then(|a| a.state.field(field).cloned())
            .unwrap_or(FieldValue::Null))
    }

    /// What a producer holds after reading the story: current state, current
    /// versions as base, one bundle per current news item.
    pub fn story_bundle(&self, story_id: EntityId) -> Result<StoryBundle, EngineError> {
        let story = self.engine.require_live(EntityKind::Story, story_id)?;
        let mut news_items = Vec::new();
        for item_id in story.state.members("news_items") {
            let item = self.engine.require_live(EntityKind::NewsItem, *item_id)?;
            news_items.push(NewsItemBundle {
                id: item.entity_id,
                base_version: Some(item.version),
                state: item.state,
            });
        }
        let mut state = story.state;
        state.relations.remove("news_items");
        Ok(StoryBundle {
            id: story_id,
            base_version: Some(story.version),
            state,
            news_items,
            attributes: Vec::new(),
        })
    }

    /// What a producer holds after reading an attribute.
    pub fn attribute_bundle(&self, attribute_id: EntityId) -> Result<AttributeBundle, EngineError> {
        let attribute = self.engine.require_live(EntityKind::Attribute, attribute_id)?;
        Ok(AttributeBundle {
            id: attribute_id,
            base_version: Some(attribute.version),
            state: attribute.state,
        })
    }

    pub fn submit(
        &mut self,
        scope: &str,
        stories: Vec<StoryBundle>,
    ) -> Result<Vec<AppliedStory>, EngineError> {
        self.engine.submit(&Submission {
            scope: ScopeId::new(scope),
            actor: ActorId::new(scope),
            stories,
        })
    }
}
