//! Simulated multi-agent analysis pipeline.
//!
//! Runs a fixed five-agent sequence in a background task, persisting each
//! agent as a workflow step and closing the workflow when the last agent
//! finishes. Unlike the chat stream, this runner does mark the workflow
//! Completed.

use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::registry::{RunRegistry, StageStatus};
use crate::storage::{MessageKind, MessagePayload, MessageStatus, ResourceKind, StepCategory, StepDescriptor};
use crate::workflow::WorkflowService;
use crate::Result;

/// The fixed agent sequence, in execution order.
pub const AGENT_STAGES: [&str; 5] = [
    "data-collector",
    "analyzer",
    "strategy-generator",
    "risk-assessor",
    "executor",
];

fn stage_category(stage: &str) -> StepCategory {
    match stage {
        "analyzer" | "risk-assessor" => StepCategory::Analysis,
        "strategy-generator" => StepCategory::Strategy,
        "executor" => StepCategory::Result,
        _ => StepCategory::General,
    }
}

fn stage_resource_kind(stage: &str) -> ResourceKind {
    match stage {
        "data-collector" => ResourceKind::Database,
        "analyzer" => ResourceKind::Api,
        _ => ResourceKind::General,
    }
}

fn stage_summary(stage: &str) -> &'static str {
    match stage {
        "data-collector" => "Collected market data and recent quotes",
        "analyzer" => "Analyzed indicators and trend signals",
        "strategy-generator" => "Generated candidate strategies",
        "risk-assessor" => "Assessed downside risk and exposure",
        "executor" => "Compiled the execution summary",
        _ => "Stage finished",
    }
}

/// Drives the five-agent pipeline for one workflow.
#[derive(Clone)]
pub struct AgentPipeline {
    service: WorkflowService,
    registry: RunRegistry,
    stage_delay: Duration,
}

impl AgentPipeline {
    pub fn new(service: WorkflowService, registry: RunRegistry) -> Self {
        Self {
            service,
            registry,
            stage_delay: Duration::from_millis(500),
        }
    }

    /// No artificial pacing. For tests.
    pub fn with_stage_delay(mut self, delay: Duration) -> Self {
        self.stage_delay = delay;
        self
    }

    /// Start the pipeline in the background. Returns the run id for
    /// polling; fails only when the workflow row cannot be created.
    #[instrument(skip(self, title))]
    pub async fn start(&self, workflow_id: &str, title: &str) -> Result<String> {
        self.service
            .create_or_get(workflow_id, title, None, None)
            .await?;

        let run_id = Uuid::new_v4().to_string();
        let stages: Vec<String> = AGENT_STAGES.iter().map(|s| s.to_string()).collect();
        self.registry.register(&run_id, workflow_id, &stages).await;

        let pipeline = self.clone();
        let task_run_id = run_id.clone();
        let task_workflow_id = workflow_id.to_string();
        let handle = tokio::spawn(async move {
            pipeline.run(&task_run_id, &task_workflow_id).await;
        });
        self.registry.attach_handle(&run_id, handle).await;

        info!(workflow_id, run_id, "agent pipeline started");
        Ok(run_id)
    }

    async fn run(&self, run_id: &str, workflow_id: &str) {
        for (i, stage) in AGENT_STAGES.iter().enumerate() {
            let number = (i + 1) as u32;
            self.registry
                .mark_stage(run_id, stage, StageStatus::Running)
                .await;

            let descriptor = StepDescriptor {
                step_id: stage.to_string(),
                step_number: number,
                content: format!("Agent {} working", stage),
                category: stage_category(stage),
                resource_kind: stage_resource_kind(stage),
                results: vec![],
                execution_details: json!({ "agent": stage }),
                urls: vec![],
                files: vec![],
            };

            if self.service.record_step(workflow_id, &descriptor).await.is_none() {
                warn!(workflow_id, stage, "agent step was not persisted, continuing");
            }
            self.service
                .extract_and_save_resources(workflow_id, &descriptor)
                .await;

            tokio::time::sleep(self.stage_delay).await;

            self.service.finish_step(workflow_id, stage).await;
            self.registry
                .mark_stage(run_id, stage, StageStatus::Completed)
                .await;
            self.registry
                .push_result(
                    run_id,
                    json!({ "agent": stage, "summary": stage_summary(stage) }),
                )
                .await;
        }

        self.service
            .record_message(
                workflow_id,
                &MessagePayload {
                    message_id: format!("{}_pipeline_result", run_id),
                    kind: MessageKind::Result,
                    content: "Agent pipeline finished".to_string(),
                    status: Some(MessageStatus::Completed),
                    data: None,
                },
            )
            .await;

        self.service.complete(workflow_id).await;
        self.registry.complete(run_id).await;
        info!(workflow_id, run_id, "agent pipeline completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::registry::RunStatus;
    use crate::storage::{SqliteStorage, StepStatus, WorkflowStatus};

    fn pipeline() -> AgentPipeline {
        let service = WorkflowService::new(SqliteStorage::open_in_memory().unwrap());
        AgentPipeline::new(service, RunRegistry::new()).with_stage_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_pipeline_runs_to_completion() {
        let pipeline = pipeline();
        let run_id = pipeline.start("wf-1", "Pipeline run").await.unwrap();

        pipeline
            .registry
            .take_handle(&run_id)
            .await
            .unwrap()
            .await
            .unwrap();

        let record = pipeline.registry.get(&run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.progress, 100.0);
        assert_eq!(record.results.len(), 5);
        assert!(record
            .stages
            .values()
            .all(|s| *s == StageStatus::Completed));

        let snapshot = pipeline
            .service
            .load_full_state("wf-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Completed);
        assert_eq!(snapshot.workflow.progress, 100.0);
        assert_eq!(snapshot.steps.len(), 5);
        assert!(snapshot.steps.iter().all(|s| s.status == StepStatus::Completed));
        // Each agent's execution details become a resource
        assert_eq!(snapshot.resources.len(), 5);
    }

    #[tokio::test]
    async fn test_restart_reuses_step_rows() {
        let pipeline = pipeline();

        let first = pipeline.start("wf-2", "Run").await.unwrap();
        pipeline.registry.take_handle(&first).await.unwrap().await.unwrap();
        let second = pipeline.start("wf-2", "Run").await.unwrap();
        pipeline.registry.take_handle(&second).await.unwrap().await.unwrap();

        // Steps are keyed by agent name, so a rerun upserts them in place
        let snapshot = pipeline
            .service
            .load_full_state("wf-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.steps.len(), 5);

        // Both runs are tracked independently
        assert_ne!(first, second);
        assert!(pipeline.registry.get(&first).await.is_some());
        assert!(pipeline.registry.get(&second).await.is_some());
    }
}
