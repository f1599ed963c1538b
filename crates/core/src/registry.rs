//! Static descriptors for the versioned aggregate kinds.
//!
//! Every kind that gets a shadow history table is described here once, at
//! compile time. Storage derives its table layout from these descriptors and
//! the engine consults them for field validation and relation diffs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::{FieldKind, FieldValue};
use crate::state::AggregateState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Story,
    NewsItem,
    Attribute,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Story => "story",
            Self::NewsItem => "news_item",
            Self::Attribute => "attribute",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "story" => Ok(Self::Story),
            "news_item" => Ok(Self::NewsItem),
            "attribute" => Ok(Self::Attribute),
            _ => Err(CoreError::Serialization(format!("unknown entity kind: {s}"))),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an aggregate's primary key is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Generated once (UUIDv7), independent of content, never reused.
    Surrogate,
    /// Hash of the aggregate's content.
    ContentDerived,
    /// Externally supplied business key that may be recycled after delete.
    Natural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind, required: true }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind, required: false }
    }
}

/// Shadow table layout for a versioned many-to-many relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinSpec {
    pub history_table: &'static str,
    /// Column holding the owning aggregate's version at link time, e.g. `story_version`.
    pub owner_version_column: &'static str,
    /// Column holding the member aggregate's version at link time, e.g. `attribute_version`.
    pub member_version_column: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationSpec {
    pub name: &'static str,
    pub target: EntityKind,
    /// Reordering members counts as a change only when set.
    pub ordered: bool,
    pub join: Option<JoinSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub kind: EntityKind,
    pub history_table: &'static str,
    pub key: KeyStrategy,
    pub fields: &'static [FieldSpec],
    pub relations: &'static [RelationSpec],
}

impl TypeDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationSpec> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Check a proposed state against the declared fields and relations.
    pub fn check_state(&self, state: &AggregateState) -> Result<(), CoreError> {
        for (name, value) in &state.fields {
            let spec = self.field(name).ok_or_else(|| {
                CoreError::InvalidData(format!("{} has no field '{name}'", self.kind))
            })?;
            if let Some(actual) = value.kind()
                && actual != spec.kind
            {
                return Err(CoreError::InvalidData(format!(
                    "{}.{name} expects {}, got {}",
                    self.kind,
                    spec.kind.as_str(),
                    actual.as_str()
                )));
            }
        }
        for spec in self.fields.iter().filter(|f| f.required) {
            match state.fields.get(spec.name) {
                None | Some(FieldValue::Null) => {
                    return Err(CoreError::InvalidData(format!(
                        "{}.{} is required",
                        self.kind, spec.name
                    )));
                }
                Some(_) => {}
            }
        }
        for name in state.relations.keys() {
            if self.relation(name).is_none() {
                return Err(CoreError::InvalidData(format!(
                    "{} has no relation '{name}'",
                    self.kind
                )));
            }
        }
        Ok(())
    }
}

fn is_sql_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

pub const ATTRIBUTE: TypeDescriptor = TypeDescriptor {
    kind: EntityKind::Attribute,
    history_table: "attribute_history",
    key: KeyStrategy::Surrogate,
    fields: &[
        FieldSpec::required("key", FieldKind::Text),
        FieldSpec::optional("value", FieldKind::Text),
        FieldSpec::optional("description", FieldKind::Text),
    ],
    relations: &[],
};

pub const NEWS_ITEM: TypeDescriptor = TypeDescriptor {
    kind: EntityKind::NewsItem,
    history_table: "news_item_history",
    key: KeyStrategy::Surrogate,
    fields: &[
        FieldSpec::required("title", FieldKind::Text),
        FieldSpec::optional("content", FieldKind::Text),
        FieldSpec::optional("review", FieldKind::Text),
        FieldSpec::optional("link", FieldKind::Text),
        FieldSpec::optional("source", FieldKind::Text),
        FieldSpec::optional("author", FieldKind::Text),
        FieldSpec::optional("language", FieldKind::Text),
        FieldSpec::optional("published", FieldKind::Timestamp),
    ],
    relations: &[RelationSpec {
        name: "attributes",
        target: EntityKind::Attribute,
        ordered: false,
        join: Some(JoinSpec {
            history_table: "news_item_attribute_history",
            owner_version_column: "news_item_version",
            member_version_column: "attribute_version",
        }),
    }],
};

pub const STORY: TypeDescriptor = TypeDescriptor {
    kind: EntityKind::Story,
    history_table: "story_history",
    key: KeyStrategy::Surrogate,
    fields: &[
        FieldSpec::required("title", FieldKind::Text),
        FieldSpec::optional("description", FieldKind::Text),
        FieldSpec::optional("summary", FieldKind::Text),
        FieldSpec::optional("comments", FieldKind::Text),
        FieldSpec::optional("important", FieldKind::Boolean),
        FieldSpec::optional("read", FieldKind::Boolean),
        FieldSpec::optional("relevance", FieldKind::Integer),
    ],
    relations: &[
        RelationSpec {
            name: "news_items",
            target: EntityKind::NewsItem,
            ordered: false,
            join: None,
        },
        RelationSpec {
            name: "attributes",
            target: EntityKind::Attribute,
            ordered: false,
            join: Some(JoinSpec {
                history_table: "story_attribute_history",
                owner_version_column: "story_version",
                member_version_column: "attribute_version",
            }),
        },
    ],
};

#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    descriptors: BTreeMap<EntityKind, TypeDescriptor>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the story, news item and attribute kinds.
    pub fn standard() -> Result<Self, CoreError> {
        let mut registry = Self::new();
        registry.register(ATTRIBUTE)?;
        registry.register(NEWS_ITEM)?;
        registry.register(STORY)?;
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: TypeDescriptor) -> Result<(), CoreError> {
        let kind = descriptor.kind;
        match descriptor.key {
            KeyStrategy::Surrogate => {}
            KeyStrategy::ContentDerived => {
                return Err(CoreError::UnstableKey {
                    kind,
                    reason: "content-derived keys change when the content does",
                });
            }
            KeyStrategy::Natural => {
                return Err(CoreError::UnstableKey {
                    kind,
                    reason: "natural keys can be reused after a delete",
                });
            }
        }
        if self.descriptors.contains_key(&kind) {
            return Err(CoreError::DuplicateKind(kind));
        }

        let invalid = |reason: String| CoreError::InvalidDescriptor { kind, reason };
        if !is_sql_identifier(descriptor.history_table) {
            return Err(invalid(format!("bad table name '{}'", descriptor.history_table)));
        }
        for (i, field) in descriptor.fields.iter().enumerate() {
            if descriptor.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(invalid(format!("duplicate field '{}'", field.name)));
            }
        }
        for relation in descriptor.relations {
            if relation.target != kind && !self.descriptors.contains_key(&relation.target) {
                return Err(invalid(format!(
                    "relation '{}' targets unregistered kind {}",
                    relation.name, relation.target
                )));
            }
            if let Some(join) = &relation.join {
                for ident in [
                    join.history_table,
                    join.owner_version_column,
                    join.member_version_column,
                ] {
                    if !is_sql_identifier(ident) {
                        return Err(invalid(format!("bad join identifier '{ident}'")));
                    }
                }
                if join.owner_version_column == join.member_version_column {
                    return Err(invalid(format!(
                        "relation '{}' uses one column for both parent versions",
                        relation.name
                    )));
                }
            }
        }

        self.descriptors.insert(kind, descriptor);
        Ok(())
    }

    pub fn get(&self, kind: EntityKind) -> Result<&TypeDescriptor, CoreError> {
        self.descriptors.get(&kind).ok_or(CoreError::UnknownKind(kind))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.descriptors.values()
    }

    /// Every versioned join, paired with the kind that owns it.
    pub fn joins(&self) -> impl Iterator<Item = (EntityKind, &RelationSpec, &JoinSpec)> {
        self.descriptors.values().flat_map(|d| {
            d.relations
                .iter()
                .filter_map(move |r| r.join.as_ref().map(|j| (d.kind, r, j)))
        })
    }
}
