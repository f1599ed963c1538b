//! External producer submissions: story bundles checked against their base.

use std::collections::BTreeSet;

use storyledger_core::{
    ActorId, AggregateState, ChangeContext, ChangeDetector, EntityId, EntityKind, ScopeId,
};
use storyledger_storage::{IncomingParent, Storage};
use tracing::{info, warn};

use crate::{Aggregate, CommitOutcome, ConflictSummary, Engine, EngineError};

const NEWS_ITEMS: &str = "news_items";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeBundle {
    pub id: EntityId,
    pub base_version: Option<u64>,
    pub state: AggregateState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsItemBundle {
    pub id: EntityId,
    /// Version the producer last saw, `None` if it believes the item is new.
    pub base_version: Option<u64>,
    pub state: AggregateState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryBundle {
    pub id: EntityId,
    pub base_version: Option<u64>,
    /// Story fields and attribute links. Item membership comes from `news_items`.
    pub state: AggregateState,
    pub news_items: Vec<NewsItemBundle>,
    pub attributes: Vec<AttributeBundle>,
}

impl StoryBundle {
    /// Story state as proposed by this bundle.
    pub fn proposed(&self) -> AggregateState {
        let mut state = self.state.clone();
        state
            .relations
            .insert(NEWS_ITEMS.to_string(), self.news_items.iter().map(|i| i.id).collect());
        state
    }

    fn item_ids(&self) -> Vec<EntityId> {
        self.news_items.iter().map(|i| i.id).collect()
    }

    fn attribute_ids(&self) -> Vec<EntityId> {
        self.attributes.iter().map(|a| a.id).collect()
    }
}

/// One producer push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub scope: ScopeId,
    pub actor: ActorId,
    pub stories: Vec<StoryBundle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStory {
    pub story: CommitOutcome,
    pub news_items: Vec<CommitOutcome>,
    pub attributes: Vec<CommitOutcome>,
}

impl Engine {
    /// Apply a producer submission, or reject it whole.
    ///
    /// Every stale entity is recorded in the conflict store and returned in
    /// `EngineError::ExternalConflict`; the conflict bookkeeping is committed
    /// even though no aggregate is written.
    pub fn submit(&mut self, submission: &Submission) -> Result<Vec<AppliedStory>, EngineError> {
        let result = self.transaction(|engine| {
            let conflicts = engine.detect_submission_conflicts(submission)?;
            if !conflicts.is_empty() {
                return Ok(Err(conflicts));
            }
            let ctx = ChangeContext::external(submission.actor.as_str(), submission.scope.clone());
            let mut applied = Vec::with_capacity(submission.stories.len());
            for bundle in &submission.stories {
                applied.push(engine.apply_bundle(bundle, &ctx)?);
            }
            Ok(Ok(applied))
        })?;

        match result {
            Ok(applied) => {
                info!(scope = %submission.scope, stories = applied.len(), "applied submission");
                Ok(applied)
            }
            Err(conflicts) => {
                warn!(
                    scope = %submission.scope,
                    conflicts = conflicts.len(),
                    "rejected stale submission"
                );
                Err(EngineError::ExternalConflict { conflicts })
            }
        }
    }

    /// Compare every story, item and attribute against its declared base,
    /// updating the conflict store. Writes no aggregate.
    fn detect_submission_conflicts(
        &mut self,
        submission: &Submission,
    ) -> Result<Vec<ConflictSummary>, EngineError> {
        let scope = &submission.scope;
        let mut conflicts = Vec::new();

        for bundle in &submission.stories {
            let proposed_story = bundle.proposed();
            self.validate(EntityKind::Story, &proposed_story)?;
            for item in &bundle.news_items {
                self.validate(EntityKind::NewsItem, &item.state)?;
            }
            for attribute in &bundle.attributes {
                self.validate(EntityKind::Attribute, &attribute.state)?;
            }

            match self.stale_aggregate(EntityKind::Story, bundle.id, bundle.base_version, &proposed_story)? {
                Some(local) => conflicts.push(self.record_conflict(
                    &local,
                    scope,
                    bundle.base_version,
                    proposed_story.clone(),
                    None,
                )?),
                None => {
                    self.clear_conflict(EntityKind::Story, bundle.id, scope)?;
                }
            }

            let parent = IncomingParent {
                story_id: bundle.id,
                story: proposed_story.clone(),
            };
            self.clear_dropped_members(EntityKind::NewsItem, scope, bundle.id, &bundle.item_ids())?;
            for item in &bundle.news_items {
                conflicts.extend(self.check_member(
                    EntityKind::NewsItem,
                    item.id,
                    item.base_version,
                    &item.state,
                    scope,
                    &parent,
                )?);
            }

            self.clear_dropped_members(
                EntityKind::Attribute,
                scope,
                bundle.id,
                &bundle.attribute_ids(),
            )?;
            // Story and item links may name the same attribute.
            let mut seen = BTreeSet::new();
            for attribute in &bundle.attributes {
                if !seen.insert(attribute.id) {
                    continue;
                }
                conflicts.extend(self.check_member(
                    EntityKind::Attribute,
                    attribute.id,
                    attribute.base_version,
                    &attribute.state,
                    scope,
                    &parent,
                )?);
            }
        }
        Ok(conflicts)
    }

    /// Record or clear the conflict of one item or attribute sent inside a story.
    fn check_member(
        &mut self,
        kind: EntityKind,
        entity_id: EntityId,
        base_version: Option<u64>,
        proposed: &AggregateState,
        scope: &ScopeId,
        parent: &IncomingParent,
    ) -> Result<Option<ConflictSummary>, EngineError> {
        match self.stale_aggregate(kind, entity_id, base_version, proposed)? {
            Some(local) => Ok(Some(self.record_conflict(
                &local,
                scope,
                base_version,
                proposed.clone(),
                Some(parent.clone()),
            )?)),
            None => {
                self.clear_conflict(kind, entity_id, scope)?;
                Ok(None)
            }
        }
    }

    fn validate(&self, kind: EntityKind, state: &AggregateState) -> Result<(), EngineError> {
        self.registry
            .get(kind)?
            .check_state(state)
            .map_err(EngineError::invalid)
    }

    /// The current aggregate when `proposed` was built on a stale base and
    /// would change it; `None` when the submission may be applied.
    fn stale_aggregate(
        &self,
        kind: EntityKind,
        entity_id: EntityId,
        base_version: Option<u64>,
        proposed: &AggregateState,
    ) -> Result<Option<Aggregate>, EngineError> {
        let Some(local) = self.get_aggregate(entity_id)? else {
            return Ok(None);
        };
        if local.kind != kind {
            return Err(EngineError::KindMismatch {
                entity_id,
                expected: kind,
                actual: local.kind,
            });
        }
        if base_version == Some(local.version) {
            return Ok(None);
        }
        let descriptor = self.registry.get(kind)?;
        let change = ChangeDetector::new(descriptor).classify(Some(&local.state), Some(proposed))?;
        Ok(change.is_material().then_some(local))
    }

    fn apply_bundle(
        &mut self,
        bundle: &StoryBundle,
        ctx: &ChangeContext,
    ) -> Result<AppliedStory, EngineError> {
        let mut attributes = Vec::with_capacity(bundle.attributes.len());
        for attribute in &bundle.attributes {
            attributes.push(self.apply_change(
                EntityKind::Attribute,
                attribute.id,
                Some(attribute.state.clone()),
                ctx,
            )?);
        }

        let mut news_items = Vec::with_capacity(bundle.news_items.len());
        for item in &bundle.news_items {
            news_items.push(self.apply_change(
                EntityKind::NewsItem,
                item.id,
                Some(item.state.clone()),
                ctx,
            )?);
            self.detach_from_other_stories(item.id, bundle.id, ctx)?;
        }

        let story = self.apply_change(EntityKind::Story, bundle.id, Some(bundle.proposed()), ctx)?;
        Ok(AppliedStory {
            story,
            news_items,
            attributes,
        })
    }

    /// A news item belongs to at most one story. The losing story was not
    /// part of the submission and has no base to check, so it gets a
    /// relation change attributed to the producer.
    fn detach_from_other_stories(
        &mut self,
        item_id: EntityId,
        story_id: EntityId,
        ctx: &ChangeContext,
    ) -> Result<(), EngineError> {
        for owner in self.storage.get_owners(item_id, NEWS_ITEMS)? {
            if owner == story_id {
                continue;
            }
            let mut state = self.require_live(EntityKind::Story, owner)?.state;
            if let Some(members) = state.relations.get_mut(NEWS_ITEMS) {
                members.retain(|m| *m != item_id);
            }
            let outcome = self.apply_change(EntityKind::Story, owner, Some(state), ctx)?;
            info!(
                %item_id,
                from = %owner,
                to = %story_id,
                version = outcome.version,
                "moved news item between stories"
            );
        }
        Ok(())
    }
}
