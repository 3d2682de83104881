//! Persistence service for workflow runs.
//!
//! All durable writes from the orchestrator and the background runners go
//! through this service. Apart from run creation, every operation degrades
//! to a logged no-op on storage failure so that a persistence hiccup can
//! never take down a live stream or a running pipeline.

use serde_json::json;
use tracing::{instrument, warn};

use crate::storage::{
    MessagePayload, ResourceType, SqliteStorage, StepDescriptor, WorkflowInstance,
    WorkflowMessage, WorkflowResource, WorkflowSnapshot, WorkflowStep,
};
use crate::Result;

/// Service wrapping [`SqliteStorage`] with run-level semantics.
#[derive(Clone)]
pub struct WorkflowService {
    storage: SqliteStorage,
}

impl WorkflowService {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Create a workflow run or resume the existing one with the same id.
    ///
    /// This is the one write whose failure propagates: without a run row
    /// there is nothing to attach steps or messages to.
    #[instrument(skip(self, description))]
    pub async fn create_or_get(
        &self,
        id: &str,
        title: &str,
        description: Option<&str>,
        owner_id: Option<&str>,
    ) -> Result<WorkflowInstance> {
        self.storage
            .create_or_get_workflow(id, title, description, owner_id)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        self.storage.get_workflow(id).await
    }

    /// Store the client-supplied context blob on the workflow.
    pub async fn set_context(&self, workflow_id: &str, context: &serde_json::Value) {
        if let Err(e) = self.storage.set_workflow_context(workflow_id, context).await {
            warn!(workflow_id, error = %e, "failed to persist workflow context");
        }
    }

    /// Record (or re-record) a step. Returns `None` when the write failed.
    pub async fn record_step(
        &self,
        workflow_id: &str,
        descriptor: &StepDescriptor,
    ) -> Option<WorkflowStep> {
        match self.storage.upsert_step(workflow_id, descriptor).await {
            Ok(step) => Some(step),
            Err(e) => {
                warn!(workflow_id, step_id = %descriptor.step_id, error = %e,
                      "failed to persist step");
                None
            }
        }
    }

    /// Mark a step completed and refresh the workflow's progress.
    pub async fn finish_step(&self, workflow_id: &str, step_id: &str) {
        match self.storage.complete_step(workflow_id, step_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(workflow_id, step_id, "completing a step that was never recorded");
                return;
            }
            Err(e) => {
                warn!(workflow_id, step_id, error = %e, "failed to complete step");
                return;
            }
        }

        if let Err(e) = self.storage.recompute_progress(workflow_id).await {
            warn!(workflow_id, error = %e, "failed to recompute progress");
        }
    }

    /// Mark a step failed with a captured error.
    pub async fn fail_step(&self, workflow_id: &str, step_id: &str, error: &str) {
        match self.storage.fail_step(workflow_id, step_id, error).await {
            Ok(true) => {}
            Ok(false) => warn!(workflow_id, step_id, "failing a step that was never recorded"),
            Err(e) => warn!(workflow_id, step_id, error = %e, "failed to record step failure"),
        }
    }

    /// Record (or update) a message by its idempotency key.
    pub async fn record_message(
        &self,
        workflow_id: &str,
        payload: &MessagePayload,
    ) -> Option<WorkflowMessage> {
        match self.storage.upsert_message(workflow_id, payload).await {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(workflow_id, message_id = %payload.message_id, error = %e,
                      "failed to persist message");
                None
            }
        }
    }

    /// Mark the workflow completed with progress forced to 100.
    pub async fn complete(&self, workflow_id: &str) {
        if let Err(e) = self.storage.complete_workflow(workflow_id).await {
            warn!(workflow_id, error = %e, "failed to complete workflow");
        }
    }

    /// Mark the workflow failed.
    pub async fn fail(&self, workflow_id: &str, error: &str) {
        if let Err(e) = self.storage.fail_workflow(workflow_id, error).await {
            warn!(workflow_id, error = %e, "failed to record workflow failure");
        }
    }

    pub async fn soft_delete(&self, workflow_id: &str) -> Result<bool> {
        self.storage.soft_delete_workflow(workflow_id).await
    }

    /// Derive and persist resources from a step's urls, files, and
    /// execution details. Each item is written independently; one bad item
    /// is logged and skipped without affecting the rest.
    #[instrument(skip(self, descriptor), fields(step_id = %descriptor.step_id))]
    pub async fn extract_and_save_resources(&self, workflow_id: &str, descriptor: &StepDescriptor) {
        let step_pk = self
            .storage
            .step_storage_key(workflow_id, &descriptor.step_id)
            .await
            .unwrap_or_default();

        for url in &descriptor.urls {
            let title = url::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_else(|| url.clone());

            let resource = WorkflowResource {
                id: uuid::Uuid::new_v4().to_string(),
                workflow_id: workflow_id.to_string(),
                step_pk: step_pk.clone(),
                source_step_id: Some(descriptor.step_id.clone()),
                resource_type: ResourceType::Web,
                title,
                description: Some(descriptor.content.clone()),
                data: json!({ "url": url }),
                category: Some(descriptor.category.to_string()),
            };
            self.save_resource(workflow_id, resource).await;
        }

        for file in &descriptor.files {
            let title = file
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(file.as_str())
                .to_string();

            let resource = WorkflowResource {
                id: uuid::Uuid::new_v4().to_string(),
                workflow_id: workflow_id.to_string(),
                step_pk: step_pk.clone(),
                source_step_id: Some(descriptor.step_id.clone()),
                resource_type: ResourceType::File,
                title,
                description: Some(descriptor.content.clone()),
                data: json!({ "path": file }),
                category: Some(descriptor.category.to_string()),
            };
            self.save_resource(workflow_id, resource).await;
        }

        if let Some(details) = descriptor.execution_details.as_object() {
            if !details.is_empty() {
                // A Web resource without a concrete url is not navigable,
                // so it is stored as General instead.
                let mut resource_type = descriptor.resource_kind.to_resource_type();
                if resource_type == ResourceType::Web && !details.contains_key("url") {
                    resource_type = ResourceType::General;
                }

                let resource = WorkflowResource {
                    id: uuid::Uuid::new_v4().to_string(),
                    workflow_id: workflow_id.to_string(),
                    step_pk: step_pk.clone(),
                    source_step_id: Some(descriptor.step_id.clone()),
                    resource_type,
                    title: descriptor.content.clone(),
                    description: None,
                    data: descriptor.execution_details.clone(),
                    category: Some(descriptor.category.to_string()),
                };
                self.save_resource(workflow_id, resource).await;
            }
        }
    }

    async fn save_resource(&self, workflow_id: &str, resource: WorkflowResource) {
        if let Err(e) = self.storage.insert_resource(&resource).await {
            warn!(workflow_id, title = %resource.title, error = %e,
                  "failed to persist resource");
        }
    }

    /// Load everything known about a workflow, for recovery and debugging.
    pub async fn load_full_state(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>> {
        let Some(workflow) = self.storage.get_workflow(workflow_id).await? else {
            return Ok(None);
        };

        Ok(Some(WorkflowSnapshot {
            steps: self.storage.list_steps(workflow_id).await?,
            messages: self.storage.list_messages(workflow_id).await?,
            resources: self.storage.list_resources(workflow_id).await?,
            workflow,
        }))
    }
}
