use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use tether_core::{
    ApprovalHost, DeletedRange, EngineConfig, EventBus, MemoryTaskStore, Mode, PendingAsk, Task,
    TaskOutcome, TaskServices, TaskState, TaskStore, TiktokenCounter,
};
use tether_providers::{ScriptedFailure, ScriptedProvider, ScriptedReply};
use tether_tools::{ApprovalRequest, ToolCallbacks, ToolExecutor, ToolOutput, ToolRegistry};
use tether_types::{
    ApiRequestInfo, AskKind, AskReply, CancelReason, Message, MessagePart, MessageRole,
    ModelInfo, ModelPricing, SayKind, TokenUsage, ToolId, ToolParam, ToolUse,
};

/// Stands in for a read-only tool that needs approval.
struct ListStub;

#[async_trait]
impl ToolExecutor for ListStub {
    fn id(&self) -> ToolId {
        ToolId::ListFiles
    }

    async fn execute(
        &self,
        tool: &ToolUse,
        callbacks: &mut dyn ToolCallbacks,
    ) -> anyhow::Result<()> {
        let path = tool.param(ToolParam::Path).unwrap_or(".").to_string();
        let request =
            ApprovalRequest::tool(ToolId::ListFiles, json!({"tool": "listFiles", "path": path}));
        if !callbacks.ask_approval(request).await? {
            return Ok(());
        }
        callbacks.push_result(ToolOutput::text(format!("listed {path}")));
        Ok(())
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 0;
    config.auto_approval.enabled = true;
    config.auto_approval.read = true;
    config
}

struct Harness {
    provider: Arc<ScriptedProvider>,
    store: Arc<MemoryTaskStore>,
    services: TaskServices,
    asks: Arc<Mutex<Vec<AskKind>>>,
}

async fn harness(replies: Vec<ScriptedReply>, store: Arc<MemoryTaskStore>) -> Harness {
    harness_with_provider(ScriptedProvider::new(replies), store).await
}

async fn harness_with_provider(provider: ScriptedProvider, store: Arc<MemoryTaskStore>) -> Harness {
    let provider = Arc::new(provider);
    let tools = ToolRegistry::new();
    tools.register(Arc::new(ListStub)).await;
    let host = ApprovalHost::new(EventBus::new());
    let services = TaskServices::new(provider.clone(), tools, store.clone(), host)
        .with_token_counter(Arc::new(TiktokenCounter::heuristic()));
    Harness {
        provider,
        store,
        services,
        asks: Arc::new(Mutex::new(Vec::new())),
    }
}

impl Harness {
    /// Records every ask, then answers it with `respond`.
    fn respond<F>(&self, mut respond: F)
    where
        F: FnMut(&PendingAsk) -> Option<AskReply> + Send + 'static,
    {
        let asks = self.asks.clone();
        self.services.host.spawn_responder(move |ask| {
            asks.lock().unwrap().push(ask.kind);
            respond(ask)
        });
    }

    fn asked(&self, kind: AskKind) -> usize {
        self.asks.lock().unwrap().iter().filter(|k| **k == kind).count()
    }
}

fn approve_all(_: &PendingAsk) -> Option<AskReply> {
    Some(AskReply::yes())
}

fn completion(result: &str) -> ScriptedReply {
    ScriptedReply::text(format!(
        "<attempt_completion>\n<result>{result}</result>\n</attempt_completion>"
    ))
    .chunked(7)
}

fn list(path: &str) -> ScriptedReply {
    ScriptedReply::text(format!(
        "Let me look.\n<list_files>\n<path>{path}</path>\n</list_files>"
    ))
    .chunked(5)
}

fn tool_results(message: &Message) -> Vec<(String, bool)> {
    message
        .parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::ToolResult {
                content, is_error, ..
            } => Some((content.clone(), *is_error)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn second_tool_in_one_message_is_skipped() {
    let h = harness(
        vec![
            ScriptedReply::text(
                "Two at once.\n<list_files>\n<path>src</path>\n</list_files>\n\
                 <read_file>\n<path>src/lib.rs</path>\n</read_file>",
            )
            .chunked(6),
            completion("Done"),
        ],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(approve_all);
    let mut task = Task::new(h.services.clone(), test_config()).await;

    let outcome = task.start("look around", Vec::new()).await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            result: "Done".to_string()
        }
    );

    let requests = h.provider.requests().await;
    assert_eq!(requests.len(), 2);
    let results = tool_results(requests[1].last().unwrap());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "listed src");
    assert!(results[1].0.contains("Only one tool may be used per message"));

    let assistant = &task.history()[1];
    assert_eq!(assistant.role, MessageRole::Assistant);
    assert_eq!(assistant.tool_use_ids().len(), 2);
    assert_eq!(task.state(), TaskState::Completed);
}

#[tokio::test]
async fn mistake_limit_asks_once_then_resets() {
    let mut replies: Vec<ScriptedReply> = (0..5)
        .map(|_| ScriptedReply::text("I am still thinking about it."))
        .collect();
    replies.push(completion("Finally"));
    let h = harness(replies, Arc::new(MemoryTaskStore::new())).await;
    h.respond(|ask| match ask.kind {
        AskKind::MistakeLimitReached => Some(AskReply::message("Use attempt_completion")),
        _ => Some(AskReply::yes()),
    });
    let mut config = test_config();
    config.limits.max_consecutive_mistakes = 5;
    let mut task = Task::new(h.services.clone(), config).await;

    let outcome = task.start("think", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(h.asked(AskKind::MistakeLimitReached), 1);
    assert_eq!(task.consecutive_mistakes(), 0);

    let requests = h.provider.requests().await;
    assert_eq!(requests.len(), 6);
    let last_user = requests[5].last().unwrap().flattened_text();
    assert!(last_user.contains("Use attempt_completion"));
    assert!(last_user.contains("You did not use a tool"));
}

#[tokio::test]
async fn rejection_stops_reading_the_reply() {
    let h = harness(
        vec![
            ScriptedReply::text(
                "<list_files>\n<path>secret</path>\n</list_files>\n\
                 This trailing text should never reach the transcript.",
            )
            .chunked(4),
            completion("Gave up"),
        ],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(|ask| match ask.kind {
        AskKind::Tool => Some(AskReply::no()),
        _ => Some(AskReply::yes()),
    });
    let mut config = test_config();
    config.auto_approval.enabled = false;
    let mut task = Task::new(h.services.clone(), config).await;

    let outcome = task.start("peek", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));

    let assistant = task.history()[1].flattened_text();
    assert!(assistant.ends_with("[Response interrupted by user feedback]"));
    assert!(!task.transcript().iter().any(|entry| entry
        .text
        .as_deref()
        .is_some_and(|text| text.contains("trailing text"))));

    let requests = h.provider.requests().await;
    let results = tool_results(requests[1].last().unwrap());
    assert_eq!(results, vec![("The user denied this operation.".to_string(), false)]);
}

#[tokio::test]
async fn abort_during_ask_persists_and_resume_answers_open_tools() {
    let store = Arc::new(MemoryTaskStore::new());
    let h = harness(
        vec![ScriptedReply::text(
            "<ask_followup_question>\n<question>Which file?</question>\n</ask_followup_question>",
        )
        .chunked(9)],
        store.clone(),
    )
    .await;
    let mut task = Task::new(h.services.clone(), test_config()).await;
    let handle = task.handle();
    h.respond(move |ask| {
        if ask.kind == AskKind::Followup {
            handle.abort();
        }
        None
    });

    let outcome = task.start("edit something", Vec::new()).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Aborted);
    assert_eq!(task.state(), TaskState::Aborted);

    let snapshot = store.load(task.id()).await.unwrap().unwrap();
    let last = snapshot.history.last().unwrap();
    assert_eq!(last.role, MessageRole::Assistant);
    assert!(last.flattened_text().contains("[Response interrupted by user]"));
    assert_eq!(last.tool_use_ids().len(), 1);
    assert!(snapshot.transcript.iter().all(|entry| !entry.partial));

    let resumed = harness(vec![completion("Resumed fine")], store.clone()).await;
    resumed.respond(approve_all);
    let mut task = Task::resume(resumed.services.clone(), test_config(), task.id())
        .await
        .unwrap();
    let outcome = task.resume_run().await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            result: "Resumed fine".to_string()
        }
    );
    assert_eq!(resumed.asked(AskKind::ResumeTask), 1);

    let requests = resumed.provider.requests().await;
    let resume_message = requests[0].last().unwrap();
    assert_eq!(resume_message.role, MessageRole::User);
    match &resume_message.parts[0] {
        MessagePart::ToolResult { content, .. } => {
            assert_eq!(content, "Tool execution was interrupted and not completed.")
        }
        other => panic!("expected interrupted tool result first, got {other:?}"),
    }
    assert!(resume_message.flattened_text().contains("[TASK RESUMPTION]"));
}

#[tokio::test]
async fn mid_stream_failure_fails_the_task() {
    let h = harness(
        vec![ScriptedReply {
            chunks: vec!["Looking at ".to_string(), "the code".to_string()],
            reasoning: None,
            usage: None,
            failure: Some(ScriptedFailure::MidStream {
                after: 1,
                message: "connection reset".to_string(),
            }),
        }],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(approve_all);
    let mut task = Task::new(h.services.clone(), test_config()).await;

    let outcome = task.start("read", Vec::new()).await.unwrap();
    let TaskOutcome::Failed { message } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("connection reset"));
    assert_eq!(task.state(), TaskState::Failed);

    let request = task
        .transcript()
        .iter()
        .find(|entry| entry.is_say(SayKind::ApiReqStarted))
        .unwrap();
    let info: ApiRequestInfo = serde_json::from_str(request.text.as_deref().unwrap()).unwrap();
    assert_eq!(info.cancel_reason, Some(CancelReason::StreamingFailed));
    assert!(info
        .streaming_failed_message
        .unwrap()
        .contains("connection reset"));

    let last = task.history().last().unwrap();
    assert!(last
        .flattened_text()
        .ends_with("[Response interrupted by API Error]"));
    assert!(last.flattened_text().starts_with("Looking at"));
}

#[tokio::test]
async fn first_chunk_failure_is_retried() {
    let h = harness(
        vec![
            ScriptedReply::failing(ScriptedFailure::FirstChunk {
                message: "overloaded".to_string(),
            }),
            completion("After retry"),
        ],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(approve_all);
    let mut task = Task::new(h.services.clone(), test_config()).await;

    let outcome = task.start("retry", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(h.asked(AskKind::ApiReqFailed), 0);
    let retried = task
        .transcript()
        .iter()
        .find(|entry| entry.is_say(SayKind::ApiReqRetried))
        .unwrap();
    assert!(retried.text.as_deref().unwrap().contains("overloaded"));
}

#[tokio::test]
async fn plan_mode_rejects_edits_as_mistakes() {
    let h = harness(
        vec![
            ScriptedReply::text(
                "<write_to_file>\n<path>notes.md</path>\n<content>hi</content>\n</write_to_file>",
            ),
            completion("Planned"),
        ],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(approve_all);
    let mut config = test_config();
    config.mode = Mode::Plan;
    let mut task = Task::new(h.services.clone(), config).await;

    let outcome = task.start("plan it", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));

    let requests = h.provider.requests().await;
    let results = tool_results(requests[1].last().unwrap());
    assert_eq!(results.len(), 1);
    assert!(results[0].1);
    assert!(results[0].0.contains("cannot be used in plan mode"));
}

#[tokio::test]
async fn oversized_context_hides_the_oldest_exchange() {
    let usage = |input_tokens| TokenUsage {
        input_tokens,
        output_tokens: 0,
        cache_write_tokens: 0,
        cache_read_tokens: 0,
    };
    let provider = ScriptedProvider::new(vec![
        list("a").with_usage(usage(100)),
        list("b").with_usage(usage(100)),
        list("c").with_usage(usage(900)),
        completion("Trimmed"),
    ])
    .with_model(ModelInfo {
        id: "tiny".to_string(),
        provider_id: "scripted".to_string(),
        display_name: "Tiny".to_string(),
        context_window: 1_000,
        max_output_tokens: Some(200),
        pricing: ModelPricing::default(),
    });
    let h = harness_with_provider(provider, Arc::new(MemoryTaskStore::new())).await;
    h.respond(approve_all);
    let mut task = Task::new(h.services.clone(), test_config()).await;

    let outcome = task.start("walk the tree", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(task.deleted_range(), Some(DeletedRange { start: 1, end: 2 }));

    let requests = h.provider.requests().await;
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[2].len(), 5);
    assert_eq!(requests[3].len(), 5);
    assert_eq!(requests[3][0], task.history()[0]);
    assert!(task
        .transcript()
        .iter()
        .any(|entry| entry.is_say(SayKind::DeletedApiReqs)));
    // The stored history keeps everything.
    assert_eq!(task.history().len(), 8);
}

#[tokio::test]
async fn oversized_reply_is_reported_and_the_loop_continues() {
    let h = harness(
        vec![
            ScriptedReply::text("x".repeat(300)).chunked(10),
            completion("Ok"),
        ],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(approve_all);
    let mut config = test_config();
    config.parser.max_buffer_bytes = 100;
    let mut task = Task::new(h.services.clone(), config).await;

    let outcome = task.start("say a lot", Vec::new()).await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            result: "Ok".to_string()
        }
    );

    let requests = h.provider.requests().await;
    assert_eq!(requests.len(), 2);
    let nudge = requests[1].last().unwrap().flattened_text();
    assert!(nudge.contains("too large"));

    let assistant = &task.history()[1];
    assert_eq!(assistant.role, MessageRole::Assistant);
    let text = assistant.flattened_text();
    assert!(text.starts_with("xxxxxxxxxx"));
    assert!(text.ends_with("[Response cut off: too large]"));
    assert!(task
        .transcript()
        .iter()
        .any(|entry| entry.is_say(SayKind::Error)
            && entry.text.as_deref().is_some_and(|t| t.contains("too large"))));
}

#[tokio::test]
async fn plan_mode_respond_carries_the_users_answer() {
    let h = harness(
        vec![
            ScriptedReply::text(
                "<plan_mode_respond>\n<response>First read, then edit.</response>\n\
                 </plan_mode_respond>",
            )
            .chunked(8),
            completion("Planned"),
        ],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(|ask| match ask.kind {
        AskKind::PlanModeRespond => Some(AskReply::message("looks good, go ahead")),
        _ => Some(AskReply::yes()),
    });
    let mut config = test_config();
    config.mode = Mode::Plan;
    let mut task = Task::new(h.services.clone(), config).await;

    let outcome = task.start("plan the change", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(h.asked(AskKind::PlanModeRespond), 1);

    let requests = h.provider.requests().await;
    let results = tool_results(requests[1].last().unwrap());
    assert_eq!(results.len(), 1);
    assert!(!results[0].1);
    assert!(results[0].0.contains("looks good, go ahead"));
}

#[tokio::test]
async fn plan_mode_respond_is_refused_in_act_mode() {
    let h = harness(
        vec![
            ScriptedReply::text(
                "<plan_mode_respond>\n<response>Here is a plan.</response>\n</plan_mode_respond>",
            ),
            completion("Done"),
        ],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(approve_all);
    let mut task = Task::new(h.services.clone(), test_config()).await;

    let outcome = task.start("just do it", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(h.asked(AskKind::PlanModeRespond), 0);

    let requests = h.provider.requests().await;
    let results = tool_results(requests[1].last().unwrap());
    assert!(results[0].1);
    assert!(results[0].0.contains("cannot be used in act mode"));
    assert!(!task
        .transcript()
        .iter()
        .any(|entry| entry.is_ask(AskKind::PlanModeRespond)));
}

#[tokio::test]
async fn auto_approval_streak_asks_before_continuing() {
    let h = harness(
        vec![list("a"), list("b"), list("c"), completion("Walked")],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(approve_all);
    let mut config = test_config();
    config.auto_approval.max_requests = 2;
    let mut task = Task::new(h.services.clone(), config).await;

    let outcome = task.start("walk", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(h.asked(AskKind::AutoApprovalMaxReqReached), 1);
    assert_eq!(h.asked(AskKind::Tool), 0);
    assert_eq!(h.provider.requests().await.len(), 4);
}

#[tokio::test]
async fn declining_the_auto_approval_reset_stops_the_task() {
    let h = harness(
        vec![list("a"), list("b"), completion("Unreached")],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(|ask| match ask.kind {
        AskKind::AutoApprovalMaxReqReached => Some(AskReply::no()),
        _ => Some(AskReply::yes()),
    });
    let mut config = test_config();
    config.auto_approval.max_requests = 2;
    let mut task = Task::new(h.services.clone(), config).await;

    let outcome = task.start("walk", Vec::new()).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Stopped);
    assert_eq!(h.provider.requests().await.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_ask_the_user() {
    let h = harness(
        vec![
            ScriptedReply::failing(ScriptedFailure::FirstChunk {
                message: "rate limited".to_string(),
            }),
            completion("Second try"),
        ],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(approve_all);
    let mut config = test_config();
    config.retry.auto_retry_attempts = 0;
    let mut task = Task::new(h.services.clone(), config).await;

    let outcome = task.start("retry by hand", Vec::new()).await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            result: "Second try".to_string()
        }
    );
    assert_eq!(h.asked(AskKind::ApiReqFailed), 1);
    assert_eq!(h.provider.requests().await.len(), 2);
    let failed = task
        .transcript()
        .iter()
        .find(|entry| entry.is_ask(AskKind::ApiReqFailed))
        .unwrap();
    assert!(failed.text.as_deref().unwrap().contains("rate limited"));
}

#[tokio::test]
async fn repeated_identical_tool_calls_are_blocked() {
    let h = harness(
        vec![
            list("a"),
            list("a"),
            list("a"),
            list("a"),
            completion("Moved on"),
        ],
        Arc::new(MemoryTaskStore::new()),
    )
    .await;
    h.respond(approve_all);
    let mut task = Task::new(h.services.clone(), test_config()).await;

    let outcome = task.start("list a", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(h.asked(AskKind::MistakeLimitReached), 1);

    let requests = h.provider.requests().await;
    assert_eq!(requests.len(), 5);
    assert_eq!(
        tool_results(requests[3].last().unwrap()),
        vec![("listed a".to_string(), false)]
    );
    let blocked = tool_results(requests[4].last().unwrap());
    assert_eq!(blocked.len(), 1);
    assert!(blocked[0].1);
    assert!(blocked[0].0.contains("identical parameters"));
}

#[tokio::test]
async fn full_context_is_condensed_into_a_summary() {
    let usage = |input_tokens| TokenUsage {
        input_tokens,
        output_tokens: 0,
        cache_write_tokens: 0,
        cache_read_tokens: 0,
    };
    let provider = ScriptedProvider::new(vec![
        list("a").with_usage(usage(100)),
        list("b").with_usage(usage(100)),
        list("c").with_usage(usage(100)),
        list("d").with_usage(usage(900)),
        ScriptedReply::text("Listed a, b and c; d is next.").chunked(6),
        completion("Condensed"),
    ])
    .with_model(ModelInfo {
        id: "tiny".to_string(),
        provider_id: "scripted".to_string(),
        display_name: "Tiny".to_string(),
        context_window: 1_000,
        max_output_tokens: Some(200),
        pricing: ModelPricing::default(),
    });
    let h = harness_with_provider(provider, Arc::new(MemoryTaskStore::new())).await;
    h.respond(approve_all);
    let mut config = test_config();
    config.context.condense_enabled = true;
    let mut task = Task::new(h.services.clone(), config).await;

    let outcome = task.start("walk the tree", Vec::new()).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(task.deleted_range(), None);

    let requests = h.provider.requests().await;
    assert_eq!(requests.len(), 6);
    let summary_request = &requests[4];
    assert_eq!(summary_request.len(), 5);
    assert!(summary_request
        .last()
        .unwrap()
        .flattened_text()
        .contains("Summarize the conversation above"));

    let after = &requests[5];
    assert_eq!(after.len(), 7);
    assert_eq!(after[0], task.history()[0]);
    assert!(after[1]
        .flattened_text()
        .starts_with("[Summary of the earlier conversation]\nListed a, b and c"));
    assert_eq!(after[2].role, MessageRole::User);

    let condensed = task
        .transcript()
        .iter()
        .find(|entry| entry.is_say(SayKind::CondenseContext))
        .unwrap();
    assert_eq!(condensed.text.as_deref(), Some("Listed a, b and c; d is next."));
    assert!(!task
        .transcript()
        .iter()
        .any(|entry| entry.is_say(SayKind::DeletedApiReqs)));
}
