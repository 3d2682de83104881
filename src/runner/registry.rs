//! In-memory registry of background runs.
//!
//! Every background execution (agent pipeline or node graph) gets a record
//! here that polling endpoints read. Task handles are stored explicitly so
//! callers and tests can await a run deterministically instead of sleeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Lifecycle of a background run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Pollable state of one background run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    /// Completed stages / total stages * 100.
    pub progress: f64,
    /// Keyed by stage name, iteration order stable for clients.
    pub stages: BTreeMap<String, StageStatus>,
    pub results: Vec<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct RunEntry {
    record: RunRecord,
    handle: Option<JoinHandle<()>>,
}

/// Shared registry of background runs.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, RunEntry>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run with all stages Idle.
    pub async fn register(&self, run_id: &str, workflow_id: &str, stages: &[String]) {
        let record = RunRecord {
            run_id: run_id.to_string(),
            workflow_id: workflow_id.to_string(),
            status: RunStatus::Pending,
            progress: 0.0,
            stages: stages
                .iter()
                .map(|s| (s.clone(), StageStatus::Idle))
                .collect(),
            results: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.runs.lock().await.insert(
            run_id.to_string(),
            RunEntry {
                record,
                handle: None,
            },
        );
    }

    /// Attach the driver task's handle so the run can be awaited later.
    pub async fn attach_handle(&self, run_id: &str, handle: JoinHandle<()>) {
        if let Some(entry) = self.runs.lock().await.get_mut(run_id) {
            entry.handle = Some(handle);
        }
    }

    /// Take the driver handle, leaving the record in place. Used by tests
    /// and shutdown paths to await completion.
    pub async fn take_handle(&self, run_id: &str) -> Option<JoinHandle<()>> {
        self.runs
            .lock()
            .await
            .get_mut(run_id)
            .and_then(|entry| entry.handle.take())
    }

    pub async fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.runs
            .lock()
            .await
            .get(run_id)
            .map(|entry| entry.record.clone())
    }

    /// Apply a mutation to a run record, if it exists.
    pub async fn update<F>(&self, run_id: &str, f: F)
    where
        F: FnOnce(&mut RunRecord),
    {
        if let Some(entry) = self.runs.lock().await.get_mut(run_id) {
            f(&mut entry.record);
        }
    }

    /// Move one stage to a new status and refresh the aggregate progress.
    pub async fn mark_stage(&self, run_id: &str, stage: &str, status: StageStatus) {
        self.update(run_id, |record| {
            if let Some(s) = record.stages.get_mut(stage) {
                *s = status;
            }
            record.status = RunStatus::Running;

            let total = record.stages.len();
            if total > 0 {
                let completed = record
                    .stages
                    .values()
                    .filter(|s| **s == StageStatus::Completed)
                    .count();
                record.progress = (completed as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
            }
        })
        .await;
    }

    pub async fn push_result(&self, run_id: &str, result: serde_json::Value) {
        self.update(run_id, |record| record.results.push(result)).await;
    }

    pub async fn complete(&self, run_id: &str) {
        self.update(run_id, |record| {
            record.status = RunStatus::Completed;
            record.progress = 100.0;
            record.finished_at = Some(Utc::now());
        })
        .await;
    }

    pub async fn fail(&self, run_id: &str, error: &str) {
        self.update(run_id, |record| {
            record.status = RunStatus::Failed;
            record.error = Some(error.to_string());
            record.finished_at = Some(Utc::now());
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_and_progress() {
        let registry = RunRegistry::new();
        registry
            .register("run-1", "wf-1", &stages(&["collect", "analyze"]))
            .await;

        let record = registry.get("run-1").await.unwrap();
        assert_eq!(record.status, RunStatus::Pending);
        assert_eq!(record.progress, 0.0);

        registry
            .mark_stage("run-1", "collect", StageStatus::Completed)
            .await;
        let record = registry.get("run-1").await.unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.progress, 50.0);
    }

    #[tokio::test]
    async fn test_failure_captures_error() {
        let registry = RunRegistry::new();
        registry.register("run-2", "wf-2", &stages(&["a"])).await;
        registry.fail("run-2", "stage a exploded").await;

        let record = registry.get("run-2").await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("stage a exploded"));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_run_is_none() {
        let registry = RunRegistry::new();
        assert!(registry.get("missing").await.is_none());
        assert!(registry.take_handle("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_take_handle_is_one_shot() {
        let registry = RunRegistry::new();
        registry.register("run-3", "wf-3", &stages(&["a"])).await;
        registry
            .attach_handle("run-3", tokio::spawn(async {}))
            .await;

        let handle = registry.take_handle("run-3").await.unwrap();
        handle.await.unwrap();
        assert!(registry.take_handle("run-3").await.is_none());
        // Record survives the handle being taken
        assert!(registry.get("run-3").await.is_some());
    }
}
