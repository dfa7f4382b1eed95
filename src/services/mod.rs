//! Engine services.

pub mod auto_responder;
pub mod criteria_analyzer;
pub mod event_fanout;
pub mod input_queue;
pub mod prompt;
pub mod task_control;
pub mod task_executor;
pub mod transcript;
pub mod workspace;

pub use auto_responder::AutoResponder;
pub use criteria_analyzer::{CompletionVerdict, CriteriaAnalyzer, CriteriaExtraction};
pub use event_fanout::{EventFanOut, TaskEvent, TaskEventStream};
pub use input_queue::{QueueStatus, UserInputQueue};
pub use task_control::{CreateTaskRequest, RecoverOptions, TaskControl};
pub use task_executor::{ExecutorConfig, TaskExecutor};
pub use transcript::TranscriptMapper;
pub use workspace::{ProvisionedWorkspace, WorkspaceManager};
