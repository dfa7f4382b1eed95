//! Domain models.

pub mod interaction;
pub mod project;
pub mod stream;
pub mod task;

pub use interaction::{ImageAttachment, Interaction, InteractionKind, ToolCall};
pub use project::{ProjectKind, ProjectSpec};
pub use stream::{StreamRecord, StreamRecordKind, UsageDelta, UsageTotals};
pub use task::{
    CriteriaConfig, ProjectAccess, ProjectAttachment, Task, TaskStatus, UserInputEntry,
};
