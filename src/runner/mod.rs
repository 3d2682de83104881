//! Background runners: the fixed agent pipeline and the node-graph
//! executor, both tracked by the shared run registry.

pub mod agents;
pub mod dag;
pub mod registry;

pub use agents::{AgentPipeline, AGENT_STAGES};
pub use dag::DagExecutor;
pub use registry::{RunRecord, RunRegistry, RunStatus, StageStatus};
