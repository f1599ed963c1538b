pub mod error;
pub mod handlers;
pub mod json;

pub use error::ApiError;
pub use handlers::{
    list_attribute_conflicts, list_news_item_conflicts, list_story_conflicts, push_stories,
    resolve_attribute_conflict, resolve_news_item_conflict, resolve_story_conflict,
    story_history, ApiResponse,
};
