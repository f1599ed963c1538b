pub mod change;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod registry;
pub mod state;
pub mod time;

pub use change::{ChangeDetector, ChangeSet, RelationDiff};
pub use error::CoreError;
pub use field_value::{FieldKind, FieldValue};
pub use ids::*;
pub use registry::{EntityKind, EntityRegistry, TypeDescriptor};
pub use state::{AggregateState, ChangeContext, ChangeKind, ChangeOrigin, HistorySnapshot, MemberRef};
