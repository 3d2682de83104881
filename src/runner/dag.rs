//! Node-graph executor.
//!
//! Takes a validated [`WorkflowDefinition`], walks its nodes in topological
//! order, and persists each node as a workflow step. The first node failure
//! fails the step, the workflow, and the run, and stops the walk.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::registry::{RunRegistry, StageStatus};
use crate::storage::{ResourceKind, StepCategory, StepDescriptor};
use crate::workflow::{DefinitionNode, WorkflowDefinition, WorkflowService};
use crate::{Error, Result};

fn node_category(node_type: &str) -> StepCategory {
    match node_type {
        "analysis" | "risk" => StepCategory::Analysis,
        "strategy" => StepCategory::Strategy,
        "output" => StepCategory::Result,
        _ => StepCategory::General,
    }
}

fn node_resource_kind(node_type: &str) -> ResourceKind {
    match node_type {
        "data" | "data_source" => ResourceKind::Database,
        "api" => ResourceKind::Api,
        "web" | "browser" => ResourceKind::Browser,
        _ => ResourceKind::General,
    }
}

/// Executes definition graphs in background tasks.
#[derive(Clone)]
pub struct DagExecutor {
    service: WorkflowService,
    registry: RunRegistry,
    node_delay: Duration,
}

impl DagExecutor {
    pub fn new(service: WorkflowService, registry: RunRegistry) -> Self {
        Self {
            service,
            registry,
            node_delay: Duration::from_millis(300),
        }
    }

    /// No artificial pacing. For tests.
    pub fn with_node_delay(mut self, delay: Duration) -> Self {
        self.node_delay = delay;
        self
    }

    /// Validate and start executing a definition. Validation problems are
    /// reported before anything is scheduled or persisted.
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    pub async fn start(&self, definition: WorkflowDefinition) -> Result<String> {
        let report = definition.validate();
        if !report.valid {
            return Err(Error::Validation(report.errors.join("; ")));
        }

        let workflow_id = format!("exec_{}", Uuid::new_v4());
        self.service
            .create_or_get(&workflow_id, &definition.name, None, None)
            .await?;

        let run_id = Uuid::new_v4().to_string();
        let order = definition.execution_order();
        self.registry.register(&run_id, &workflow_id, &order).await;

        let executor = self.clone();
        let task_run_id = run_id.clone();
        let task_workflow_id = workflow_id.clone();
        let handle = tokio::spawn(async move {
            executor
                .run(&task_run_id, &task_workflow_id, definition, order)
                .await;
        });
        self.registry.attach_handle(&run_id, handle).await;

        info!(workflow_id, run_id, "definition execution started");
        Ok(run_id)
    }

    async fn run(
        &self,
        run_id: &str,
        workflow_id: &str,
        definition: WorkflowDefinition,
        order: Vec<String>,
    ) {
        let nodes: HashMap<&str, &DefinitionNode> = definition
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n))
            .collect();

        for (i, node_id) in order.iter().enumerate() {
            // Validation guarantees every ordered id resolves
            let Some(node) = nodes.get(node_id.as_str()) else {
                warn!(workflow_id, node_id, "ordered node missing from definition");
                continue;
            };

            self.registry
                .mark_stage(run_id, node_id, StageStatus::Running)
                .await;

            let descriptor = StepDescriptor {
                step_id: node.id.clone(),
                step_number: (i + 1) as u32,
                content: node.name.clone(),
                category: node_category(&node.node_type),
                resource_kind: node_resource_kind(&node.node_type),
                results: vec![],
                execution_details: json!({ "nodeType": node.node_type, "config": node.config }),
                urls: vec![],
                files: vec![],
            };
            self.service.record_step(workflow_id, &descriptor).await;

            tokio::time::sleep(self.node_delay).await;

            match execute_node(node) {
                Ok(result) => {
                    self.service.finish_step(workflow_id, &node.id).await;
                    self.registry
                        .mark_stage(run_id, node_id, StageStatus::Completed)
                        .await;
                    self.registry.push_result(run_id, result).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(workflow_id, node_id, error = %message, "node execution failed");

                    self.service.fail_step(workflow_id, &node.id, &message).await;
                    self.service.fail(workflow_id, &message).await;
                    self.registry
                        .mark_stage(run_id, node_id, StageStatus::Failed)
                        .await;
                    self.registry.fail(run_id, &message).await;
                    return;
                }
            }
        }

        self.service.complete(workflow_id).await;
        self.registry.complete(run_id).await;
        info!(workflow_id, run_id, "definition execution completed");
    }
}

/// Execute one node. Node work is simulated; the `simulate_error` config
/// flag exercises the failure path.
fn execute_node(node: &DefinitionNode) -> Result<serde_json::Value> {
    if node
        .config
        .get("simulate_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return Err(Error::Execution(format!(
            "node '{}' failed during execution",
            node.id
        )));
    }

    let output = match node.node_type.as_str() {
        "data" | "data_source" => json!({ "rows": 128, "source": "market-data" }),
        "analysis" => json!({ "signals": ["ma_cross", "volume_spike"] }),
        "strategy" => json!({ "strategy": "balanced", "confidence": 0.7 }),
        "risk" => json!({ "riskLevel": "moderate" }),
        "output" => json!({ "report": "ready" }),
        other => json!({ "nodeType": other, "status": "done" }),
    };

    Ok(json!({ "nodeId": node.id, "output": output }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::registry::RunStatus;
    use crate::storage::{StepStatus, SqliteStorage, WorkflowStatus};
    use crate::workflow::Connection;

    fn executor() -> DagExecutor {
        let service = WorkflowService::new(SqliteStorage::open_in_memory().unwrap());
        DagExecutor::new(service, RunRegistry::new()).with_node_delay(Duration::ZERO)
    }

    fn node(id: &str, node_type: &str) -> DefinitionNode {
        DefinitionNode {
            id: id.to_string(),
            node_type: node_type.to_string(),
            name: format!("{} node", id),
            config: serde_json::Value::Null,
        }
    }

    fn edge(from: &str, to: &str) -> Connection {
        Connection {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    async fn finish(executor: &DagExecutor, run_id: &str) {
        executor
            .registry
            .take_handle(run_id)
            .await
            .unwrap()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_executes_in_topological_order() {
        let executor = executor();
        let definition = WorkflowDefinition {
            name: "diamond".to_string(),
            nodes: vec![
                node("out", "output"),
                node("risk", "risk"),
                node("collect", "data"),
                node("analyze", "analysis"),
            ],
            connections: vec![
                edge("collect", "analyze"),
                edge("collect", "risk"),
                edge("analyze", "out"),
                edge("risk", "out"),
            ],
        };

        let run_id = executor.start(definition).await.unwrap();
        finish(&executor, &run_id).await;

        let record = executor.registry.get(&run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.results.len(), 4);
        // First and last node follow the edges regardless of declaration order
        assert_eq!(record.results[0]["nodeId"], "collect");
        assert_eq!(record.results[3]["nodeId"], "out");

        let snapshot = executor
            .service
            .load_full_state(&record.workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Completed);
        assert_eq!(snapshot.steps.len(), 4);
        assert_eq!(snapshot.steps[0].step_id, "collect");
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected_before_scheduling() {
        let executor = executor();
        let definition = WorkflowDefinition {
            name: "loop".to_string(),
            nodes: vec![node("a", "data"), node("b", "analysis")],
            connections: vec![edge("a", "b"), edge("b", "a")],
        };

        let err = executor.start(definition).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("cyclic dependency"));
    }

    #[tokio::test]
    async fn test_node_failure_halts_the_walk() {
        let executor = executor();
        let mut failing = node("analyze", "analysis");
        failing.config = json!({ "simulate_error": true });

        let definition = WorkflowDefinition {
            name: "fails midway".to_string(),
            nodes: vec![node("collect", "data"), failing, node("out", "output")],
            connections: vec![edge("collect", "analyze"), edge("analyze", "out")],
        };

        let run_id = executor.start(definition).await.unwrap();
        finish(&executor, &run_id).await;

        let record = executor.registry.get(&run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("analyze"));
        // Only the node before the failure produced a result
        assert_eq!(record.results.len(), 1);
        assert_eq!(record.stages["out"], StageStatus::Idle);

        let snapshot = executor
            .service
            .load_full_state(&record.workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Failed);
        assert!(snapshot.workflow.error.is_some());

        let failed_step = snapshot
            .steps
            .iter()
            .find(|s| s.step_id == "analyze")
            .unwrap();
        assert_eq!(failed_step.status, StepStatus::Failed);
        // The downstream node was never started
        assert!(!snapshot.steps.iter().any(|s| s.step_id == "out"));
    }
}
