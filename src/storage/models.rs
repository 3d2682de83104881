//! Storage models.
//!
//! The enums here are closed variants on purpose: the upstream protocol the
//! frontend speaks uses lowercase strings ("browser", "thinking", ...), and
//! keeping them as sum types makes rules like the Web-to-General resource
//! downgrade total functions instead of ad hoc string checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Unknown workflow status: {}", s)),
        }
    }
}

/// Step lifecycle status.
///
/// Transitions are Pending -> Running -> Completed | Failed; re-upserting a
/// step forces it back to Running with fresh timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

/// Step category, describing what kind of work a step represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepCategory {
    Analysis,
    Strategy,
    #[default]
    General,
    Result,
    Error,
}

impl std::fmt::Display for StepCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Analysis => write!(f, "analysis"),
            Self::Strategy => write!(f, "strategy"),
            Self::General => write!(f, "general"),
            Self::Result => write!(f, "result"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for StepCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "strategy" => Ok(Self::Strategy),
            "general" => Ok(Self::General),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown step category: {}", s)),
        }
    }
}

/// What kind of external action a step represents.
///
/// Determines both the default outbound links a step gets and the type of
/// the resource derived from its execution details.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Browser,
    Database,
    Api,
    #[default]
    General,
}

impl ResourceKind {
    /// Map a step's declared kind to the resource type stored for its
    /// execution-details payload.
    pub fn to_resource_type(self) -> ResourceType {
        match self {
            Self::Browser => ResourceType::Web,
            Self::Database => ResourceType::Database,
            Self::Api => ResourceType::Api,
            Self::General => ResourceType::General,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Browser => write!(f, "browser"),
            Self::Database => write!(f, "database"),
            Self::Api => write!(f, "api"),
            Self::General => write!(f, "general"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "browser" => Ok(Self::Browser),
            "database" => Ok(Self::Database),
            "api" => Ok(Self::Api),
            "general" => Ok(Self::General),
            _ => Err(format!("Unknown resource kind: {}", s)),
        }
    }
}

/// Type of a derived workflow resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Web,
    Database,
    Api,
    File,
    Chart,
    General,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Database => write!(f, "database"),
            Self::Api => write!(f, "api"),
            Self::File => write!(f, "file"),
            Self::Chart => write!(f, "chart"),
            Self::General => write!(f, "general"),
        }
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Self::Web),
            "database" => Ok(Self::Database),
            "api" => Ok(Self::Api),
            "file" => Ok(Self::File),
            "chart" => Ok(Self::Chart),
            "general" => Ok(Self::General),
            _ => Err(format!("Unknown resource type: {}", s)),
        }
    }
}

/// Who or what authored a workflow message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    System,
    Task,
    Result,
    Assistant,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::System => write!(f, "system"),
            Self::Task => write!(f, "task"),
            Self::Result => write!(f, "result"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            "task" => Ok(Self::Task),
            "result" => Ok(Self::Result),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Unknown message kind: {}", s)),
        }
    }
}

/// Delivery status of a workflow message.
///
/// Closed vocabulary covering every value the orchestrator emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Started,
    Thinking,
    Streaming,
    Completed,
    Fallback,
    Error,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Started => write!(f, "started"),
            Self::Thinking => write!(f, "thinking"),
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::Fallback => write!(f, "fallback"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "started" => Ok(Self::Started),
            "thinking" => Ok(Self::Thinking),
            "streaming" => Ok(Self::Streaming),
            "completed" => Ok(Self::Completed),
            "fallback" => Ok(Self::Fallback),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown message status: {}", s)),
        }
    }
}

/// One end-to-end workflow run, identified by a client-visible id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub owner_id: Option<String>,
    pub status: WorkflowStatus,
    /// Derived: completed steps / total steps * 100, clamped to [0, 100].
    pub progress: f64,
    pub current_step: u32,
    /// High-water mark, never decreases within a run.
    pub total_steps: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub context: serde_json::Value,
    pub error: Option<String>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One unit of work within a workflow.
///
/// `id` is the storage key; `(workflow_id, step_id)` is the business
/// identity used for idempotent upserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub workflow_id: String,
    pub step_id: String,
    pub step_number: u32,
    pub content: String,
    pub category: StepCategory,
    pub resource_kind: ResourceKind,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub execution_details: serde_json::Value,
    pub results: Vec<String>,
    pub urls: Vec<String>,
    pub files: Vec<String>,
    pub error: Option<String>,
}

/// A message in a workflow's append-plus-idempotent-update log.
///
/// `(workflow_id, message_id)` is the idempotency key: re-sending the same
/// message id updates the existing row rather than creating a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMessage {
    pub id: String,
    pub workflow_id: String,
    pub message_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub status: Option<MessageStatus>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A derived, navigable or inspectable artifact extracted from a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResource {
    pub id: String,
    pub workflow_id: String,
    /// Storage key of the owning step, when the step row already existed at
    /// extraction time. The business step id survives in `source_step_id`
    /// either way, for later correlation.
    pub step_pk: Option<String>,
    pub source_step_id: Option<String>,
    pub resource_type: ResourceType,
    pub title: String,
    pub description: Option<String>,
    pub data: serde_json::Value,
    pub category: Option<String>,
}

/// Write payload for a step upsert.
///
/// This is what the generator and the runners hand to the persistence
/// service; content, details, urls, and files are last-write-wins on
/// re-upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub step_id: String,
    pub step_number: u32,
    pub content: String,
    #[serde(default)]
    pub category: StepCategory,
    #[serde(default)]
    pub resource_kind: ResourceKind,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub execution_details: serde_json::Value,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Write payload for a message upsert, keyed by the client message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: String,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Read-only snapshot of a workflow for recovery and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow: WorkflowInstance,
    /// Ordered by step number.
    pub steps: Vec<WorkflowStep>,
    /// Ordered by timestamp.
    pub messages: Vec<WorkflowMessage>,
    pub resources: Vec<WorkflowResource>,
}

/// Database health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub foreign_keys_enabled: bool,
    pub integrity_check: String,
    pub orphaned_steps: u64,
    pub orphaned_messages: u64,
    pub orphaned_resources: u64,
    pub journal_mode: String,
    pub busy_timeout_ms: i64,
}
