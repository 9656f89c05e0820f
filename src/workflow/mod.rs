/// Workflow layer
///
/// Workflow metadata (remote id, input/output wiring) and the pluggable
/// runner that executes a workflow on the remote engine.

// Workflow entity mirrored from the remote engine
pub mod types;

// Remote execution contract and HTTP implementation
pub mod runner;

pub use runner::{HttpWorkflowRunner, WorkflowRunner};
pub use types::Workflow;
