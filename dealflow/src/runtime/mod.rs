/// Builder wiring the orchestrator's collaborators.
pub mod builder;
/// Cooperative run cancellation.
pub mod cancel;
/// DAG execution loop.
pub mod orchestrator;

pub use builder::PipelineOrchestratorBuilder;
pub use cancel::CancelToken;
pub use orchestrator::{PipelineOrchestrator, RunHandle};
