//! Streaming orchestration.
//!
//! One driver task per chat stream. The driver owns the whole event
//! protocol: exactly one `start`, interleaved `progress` / `content` /
//! `resource_updated` events, then exactly one terminal `complete` or
//! `error`. Persistence failures along the way are logged and skipped; the
//! only error a client ever sees is the generic terminal `error` event.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::ai::TextGenerator;
use crate::generator::{enrich_steps_with_urls, StepGenerator};
use crate::storage::{
    MessageKind, MessagePayload, MessageStatus, ResourceType, StepCategory, StepDescriptor,
};
use crate::workflow::WorkflowService;
use crate::Result;

const ANSWER_MAX_TOKENS: u32 = 2000;
const ANSWER_STEP_ID: &str = "final_answer";

/// Events sent over the SSE channel, tagged for the frontend protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Start { message_id: String },

    #[serde(rename_all = "camelCase")]
    Progress {
        content: String,
        step: u32,
        total_steps: u32,
        step_id: String,
        category: StepCategory,
        resource_type: ResourceType,
        results: Vec<String>,
        execution_details: serde_json::Value,
        urls: Vec<String>,
        files: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    Content {
        content: String,
        step_id: String,
        category: StepCategory,
    },

    /// Nudges the client to refetch derived resources.
    #[serde(rename_all = "camelCase")]
    ResourceUpdated {
        workflow_id: String,
        trigger: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_number: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Complete { message_id: String },

    #[serde(rename_all = "camelCase")]
    Error { error: String },
}

/// A chat streaming request.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamRequest {
    pub workflow_id: String,
    pub message_id: String,
    pub message: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Free-form conversation context, stored on the workflow and handed
    /// to the step generator.
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Pacing knobs for the stream. Tests zero these out.
#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    /// Simulated work per step.
    pub step_delay: Duration,
    /// Pause between streamed answer paragraphs.
    pub paragraph_delay: Duration,
    /// Upper bound on the final answer generation call.
    pub ai_timeout: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(800),
            paragraph_delay: Duration::from_millis(150),
            ai_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamTiming {
    /// No artificial pacing, short AI deadline. For tests.
    pub fn instant() -> Self {
        Self {
            step_delay: Duration::ZERO,
            paragraph_delay: Duration::ZERO,
            ai_timeout: Duration::from_secs(5),
        }
    }
}

/// Drives one chat stream end to end.
#[derive(Clone)]
pub struct StreamOrchestrator {
    service: WorkflowService,
    generator: Arc<StepGenerator>,
    ai: Arc<dyn TextGenerator>,
    timing: StreamTiming,
}

impl StreamOrchestrator {
    pub fn new(
        service: WorkflowService,
        generator: Arc<StepGenerator>,
        ai: Arc<dyn TextGenerator>,
        timing: StreamTiming,
    ) -> Self {
        Self {
            service,
            generator,
            ai,
            timing,
        }
    }

    /// Spawn the driver task and hand back the event receiver.
    ///
    /// The receiver being dropped (client disconnect) makes the next send
    /// fail, which stops the driver; persistence keeps whatever state was
    /// written up to that point.
    pub fn stream(&self, request: StreamRequest) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        let orchestrator = self.clone();

        tokio::spawn(async move {
            let workflow_id = request.workflow_id.clone();
            if let Err(e) = orchestrator.run(request, &tx).await {
                error!(workflow_id, error = %e, "stream driver failed");
                let _ = tx
                    .send(StreamEvent::Error {
                        error: "The analysis could not be completed. Please try again."
                            .to_string(),
                    })
                    .await;
            }
        });

        rx
    }

    async fn run(&self, request: StreamRequest, tx: &mpsc::Sender<StreamEvent>) -> Result<()> {
        let workflow_id = &request.workflow_id;
        let title: String = request.message.chars().take(80).collect();

        // The one persistence call that must succeed; everything downstream
        // degrades gracefully.
        self.service
            .create_or_get(workflow_id, &title, None, request.owner_id.as_deref())
            .await?;
        if !request.context.is_null() {
            self.service.set_context(workflow_id, &request.context).await;
        }

        self.service
            .record_message(
                workflow_id,
                &MessagePayload {
                    message_id: request.message_id.clone(),
                    kind: MessageKind::User,
                    content: request.message.clone(),
                    status: Some(MessageStatus::Sent),
                    data: None,
                },
            )
            .await;

        if !emit(tx, StreamEvent::Start { message_id: request.message_id.clone() }).await {
            return Ok(());
        }

        let mut steps = self
            .generator
            .generate(&request.message, &request.context)
            .await;
        enrich_steps_with_urls(&mut steps, &request.message);
        let total = steps.len() as u32;

        info!(workflow_id, steps = total, "streaming step plan");

        for (i, step) in steps.iter().enumerate() {
            if !self.run_step(&request, step, i as u32 + 1, total, tx).await {
                return Ok(());
            }
        }

        self.stream_answer(&request, &steps, tx).await;
        Ok(())
    }

    /// Execute one plan step. Returns false when the client is gone.
    async fn run_step(
        &self,
        request: &StreamRequest,
        step: &StepDescriptor,
        number: u32,
        total: u32,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> bool {
        let workflow_id = &request.workflow_id;
        let step_message_id = format!("{}_step_{}", request.message_id, number);

        let progress = StreamEvent::Progress {
            content: step.content.clone(),
            step: number,
            total_steps: total,
            step_id: step.step_id.clone(),
            category: step.category,
            resource_type: step.resource_kind.to_resource_type(),
            results: step.results.clone(),
            execution_details: step.execution_details.clone(),
            urls: step.urls.clone(),
            files: step.files.clone(),
        };
        if !emit(tx, progress).await {
            return false;
        }

        self.service.record_step(workflow_id, step).await;
        self.service
            .record_message(
                workflow_id,
                &MessagePayload {
                    message_id: step_message_id.clone(),
                    kind: MessageKind::Task,
                    content: step.content.clone(),
                    status: Some(MessageStatus::Thinking),
                    data: None,
                },
            )
            .await;
        self.service
            .extract_and_save_resources(workflow_id, step)
            .await;

        if !emit(
            tx,
            StreamEvent::ResourceUpdated {
                workflow_id: workflow_id.clone(),
                trigger: "step_thinking".to_string(),
                step_number: Some(number),
                message_id: None,
            },
        )
        .await
        {
            return false;
        }

        tokio::time::sleep(self.timing.step_delay).await;
        self.service.finish_step(workflow_id, &step.step_id).await;

        emit(
            tx,
            StreamEvent::ResourceUpdated {
                workflow_id: workflow_id.clone(),
                trigger: "step_completed".to_string(),
                step_number: Some(number),
                message_id: Some(step_message_id),
            },
        )
        .await
    }

    /// Stream the final assistant answer, from the AI when possible and a
    /// deterministic fallback otherwise. The terminal `complete` is emitted
    /// either way; the workflow row stays Running on purpose so that later
    /// messages on the same id resume it seamlessly.
    async fn stream_answer(
        &self,
        request: &StreamRequest,
        steps: &[StepDescriptor],
        tx: &mpsc::Sender<StreamEvent>,
    ) {
        let workflow_id = &request.workflow_id;
        let answer_id = format!("{}_answer", request.message_id);

        let generated = match tokio::time::timeout(
            self.timing.ai_timeout,
            self.ai.generate(&answer_prompt(&request.message, steps), ANSWER_MAX_TOKENS),
        )
        .await
        {
            Ok(Ok(text)) if !text.trim().is_empty() => Some(text),
            Ok(Ok(_)) => {
                warn!(workflow_id, "answer generation returned empty text");
                None
            }
            Ok(Err(e)) => {
                warn!(workflow_id, error = %e, "answer generation failed");
                None
            }
            Err(_) => {
                warn!(workflow_id, "answer generation timed out");
                None
            }
        };

        let (paragraphs, status) = match &generated {
            Some(text) => (
                text.split("\n\n")
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                MessageStatus::Streaming,
            ),
            None => (vec![fallback_answer(steps)], MessageStatus::Fallback),
        };

        let mut accumulated = String::new();
        for paragraph in &paragraphs {
            if !accumulated.is_empty() {
                accumulated.push_str("\n\n");
            }
            accumulated.push_str(paragraph);

            self.service
                .record_message(
                    workflow_id,
                    &MessagePayload {
                        message_id: answer_id.clone(),
                        kind: MessageKind::Assistant,
                        content: accumulated.clone(),
                        status: Some(status),
                        data: None,
                    },
                )
                .await;

            if !emit(
                tx,
                StreamEvent::Content {
                    content: paragraph.clone(),
                    step_id: ANSWER_STEP_ID.to_string(),
                    category: StepCategory::Result,
                },
            )
            .await
            {
                return;
            }
            if !emit(
                tx,
                StreamEvent::ResourceUpdated {
                    workflow_id: workflow_id.clone(),
                    trigger: "assistant_message".to_string(),
                    step_number: None,
                    message_id: Some(answer_id.clone()),
                },
            )
            .await
            {
                return;
            }

            tokio::time::sleep(self.timing.paragraph_delay).await;
        }

        if !emit(
            tx,
            StreamEvent::Complete {
                message_id: request.message_id.clone(),
            },
        )
        .await
        {
            return;
        }

        // Settle the answer row after the terminal event so a reconnecting
        // client reads a consistent final state.
        self.service
            .record_message(
                workflow_id,
                &MessagePayload {
                    message_id: answer_id,
                    kind: MessageKind::Assistant,
                    content: accumulated,
                    status: Some(MessageStatus::Completed),
                    data: None,
                },
            )
            .await;
    }
}

/// Send one event. False means the receiver is gone and the driver should
/// stop quietly.
async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

fn answer_prompt(message: &str, steps: &[StepDescriptor]) -> String {
    let mut prompt = String::from(
        "You are a financial analysis assistant. Based on the completed \
         analysis steps below, answer the user's question in a few short \
         paragraphs separated by blank lines.\n\nCompleted steps:\n",
    );
    for step in steps {
        prompt.push_str("- ");
        prompt.push_str(&step.content);
        prompt.push('\n');
    }
    prompt.push_str("\nUser question: ");
    prompt.push_str(message);
    prompt
}

fn fallback_answer(steps: &[StepDescriptor]) -> String {
    let mut answer = String::from(
        "The analysis steps above have completed. A detailed narrative could \
         not be generated right now, so here is a summary of what was done: ",
    );
    let contents: Vec<&str> = steps.iter().map(|s| s.content.as_str()).collect();
    answer.push_str(&contents.join("; "));
    answer.push('.');
    answer
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::storage::{SqliteStorage, WorkflowStatus};

    /// Returns scripted replies in order, then errors.
    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<String, String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }

        fn failing() -> Self {
            Self::new(vec![])
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err("no scripted reply".to_string()))
                .map_err(crate::Error::Generation)
        }
    }

    fn orchestrator(ai: Scripted) -> StreamOrchestrator {
        let service = WorkflowService::new(SqliteStorage::open_in_memory().unwrap());
        let ai: Arc<dyn TextGenerator> = Arc::new(ai);
        StreamOrchestrator::new(
            service,
            Arc::new(StepGenerator::new(ai.clone())),
            ai,
            StreamTiming::instant(),
        )
    }

    fn request(workflow_id: &str, message: &str) -> StreamRequest {
        StreamRequest {
            workflow_id: workflow_id.to_string(),
            message_id: "msg-1".to_string(),
            message: message.to_string(),
            owner_id: None,
            context: serde_json::Value::Null,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_protocol_order_with_ai_unavailable() {
        let orch = orchestrator(Scripted::failing());
        let events = collect(orch.stream(request("wf-1", "analyze 600519"))).await;

        // AI being down is invisible at the protocol level: fallback plan,
        // fallback answer, normal terminal complete.
        assert!(matches!(events.first(), Some(StreamEvent::Start { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));

        let progress_steps: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Progress { step, total_steps, .. } => {
                    assert_eq!(*total_steps, 4);
                    Some(*step)
                }
                _ => None,
            })
            .collect();
        assert_eq!(progress_steps, vec![1, 2, 3, 4]);

        // Exactly one content paragraph in fallback mode
        let content_count = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Content { .. }))
            .count();
        assert_eq!(content_count, 1);
    }

    #[tokio::test]
    async fn test_persisted_state_after_fallback_stream() {
        let orch = orchestrator(Scripted::failing());
        let service = orch.service.clone();
        collect(orch.stream(request("wf-2", "analyze 600519"))).await;

        let snapshot = service.load_full_state("wf-2").await.unwrap().unwrap();

        // All steps completed, progress at 100, but the workflow stays
        // Running: only background runners close workflows.
        assert_eq!(snapshot.workflow.progress, 100.0);
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Running);
        assert_eq!(snapshot.steps.len(), 4);
        assert!(snapshot
            .steps
            .iter()
            .all(|s| s.status == crate::storage::StepStatus::Completed));

        let answer = snapshot
            .messages
            .iter()
            .find(|m| m.message_id == "msg-1_answer")
            .unwrap();
        assert_eq!(answer.status, Some(MessageStatus::Completed));
        assert!(!answer.content.is_empty());

        // User message + 4 task messages + answer
        assert_eq!(snapshot.messages.len(), 6);
    }

    #[tokio::test]
    async fn test_ai_answer_streams_by_paragraph() {
        // First scripted reply feeds the plan, second feeds the answer.
        let plan = r#"[{"content": "Check the quote", "resource_kind": "database"},
                       {"content": "Summarize", "category": "result"}]"#;
        let orch = orchestrator(Scripted::new(vec![
            Ok(plan.to_string()),
            Ok("First paragraph.\n\nSecond paragraph.".to_string()),
        ]));
        let service = orch.service.clone();
        let events = collect(orch.stream(request("wf-3", "quick look at 600519"))).await;

        let contents: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Content { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(contents, vec!["First paragraph.", "Second paragraph."]);

        // Every content paragraph is chased by a resource nudge
        let nudges = events
            .iter()
            .filter(|e| {
                matches!(e, StreamEvent::ResourceUpdated { trigger, .. }
                         if trigger == "assistant_message")
            })
            .count();
        assert_eq!(nudges, 2);

        let snapshot = service.load_full_state("wf-3").await.unwrap().unwrap();
        let answer = snapshot
            .messages
            .iter()
            .find(|m| m.message_id == "msg-1_answer")
            .unwrap();
        assert_eq!(answer.content, "First paragraph.\n\nSecond paragraph.");
        assert_eq!(answer.status, Some(MessageStatus::Completed));
    }

    #[tokio::test]
    async fn test_context_lands_on_the_workflow_row() {
        let orch = orchestrator(Scripted::failing());
        let service = orch.service.clone();

        let mut req = request("wf-ctx", "analyze 600519");
        req.context = serde_json::json!({"symbol": "600519", "risk": "low"});
        collect(orch.stream(req)).await;

        let workflow = service.get("wf-ctx").await.unwrap().unwrap();
        assert_eq!(
            workflow.context,
            serde_json::json!({"symbol": "600519", "risk": "low"})
        );
    }

    #[tokio::test]
    async fn test_end_to_end_symbol_message() {
        let orch = orchestrator(Scripted::failing());
        let service = orch.service.clone();
        let events = collect(orch.stream(request("wf-cjk", "分析一下000001"))).await;

        assert!(matches!(events.first(), Some(StreamEvent::Start { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));

        let progress_count = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Progress { .. }))
            .count();
        assert!((2..=6).contains(&progress_count));

        // Each progress step is paired with a thinking and a completed nudge
        for trigger in ["step_thinking", "step_completed"] {
            let nudges = events
                .iter()
                .filter(|e| {
                    matches!(e, StreamEvent::ResourceUpdated { trigger: t, .. } if t == trigger)
                })
                .count();
            assert_eq!(nudges, progress_count);
        }

        let snapshot = service.load_full_state("wf-cjk").await.unwrap().unwrap();
        assert_eq!(snapshot.steps.len(), progress_count);
        // Symbol lane: the fallback plan talks about the detected code
        assert!(snapshot.steps.iter().any(|s| s.content.contains("000001")));
    }

    #[tokio::test]
    async fn test_replayed_request_does_not_duplicate_rows() {
        let orch = orchestrator(Scripted::failing());
        let service = orch.service.clone();

        collect(orch.stream(request("wf-4", "analyze 600519"))).await;
        collect(orch.stream(request("wf-4", "analyze 600519"))).await;

        let snapshot = service.load_full_state("wf-4").await.unwrap().unwrap();
        assert_eq!(snapshot.steps.len(), 4);
        assert_eq!(snapshot.messages.len(), 6);
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_driver() {
        let orch = orchestrator(Scripted::failing());
        let service = orch.service.clone();

        let mut rx = orch.stream(request("wf-5", "analyze 600519"));
        // Read the start event, then walk away.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::Start { .. }));
        drop(rx);

        // Give the driver a moment to notice the closed channel.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Whatever was persisted is kept; the workflow is not failed.
        let workflow = service.get("wf-5").await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Running);
    }

    #[test]
    fn test_event_wire_format() {
        let event = StreamEvent::Start {
            message_id: "m-1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "start", "messageId": "m-1"})
        );

        let event = StreamEvent::ResourceUpdated {
            workflow_id: "wf".to_string(),
            trigger: "step_completed".to_string(),
            step_number: Some(2),
            message_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "resource_updated");
        assert_eq!(value["stepNumber"], 2);
        // Absent optional fields are omitted entirely
        assert!(value.get("messageId").is_none());
    }
}
