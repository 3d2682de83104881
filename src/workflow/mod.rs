//! Workflow domain: the persistence service and client-submitted
//! definitions.

pub mod definition;
pub mod service;

pub use definition::{Connection, DefinitionNode, ValidationReport, WorkflowDefinition};
pub use service::WorkflowService;
