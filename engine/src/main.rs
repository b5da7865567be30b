use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use tether_core::{
    ApprovalHost, CancellationRegistry, ConfigStore, EngineConfig, EventBus, FileTaskStore, Mode,
    PendingAsk, Task, TaskOutcome, TaskServices, TaskStore,
};
use tether_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tether_providers::ScriptedProvider;
use tether_tools::{ToolRegistry, Workspace};
use tether_types::{AskKind, AskReply, EngineEvent, EntryKind, SayKind, ToolId, TranscriptEntry};

const APPROVAL_CATEGORIES: [&str; 5] = ["read", "edit", "execute", "browse", "external_tool"];

#[derive(Parser, Debug)]
#[command(name = "tether-engine")]
#[command(about = "Headless Tether agent engine")]
struct Cli {
    /// Where tasks and logs are kept.
    #[arg(long, global = true)]
    state_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new task, replaying model replies from a script file.
    Run {
        task: String,
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
        /// Tool categories to auto-approve, e.g. `read,edit`.
        #[arg(long, value_delimiter = ',')]
        allow: Vec<String>,
        #[arg(long)]
        mode: Option<String>,
        /// Answer every ask with yes.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Pick up a stored task where it stopped.
    Resume {
        task_id: String,
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Print a stored task's transcript, or its model history.
    Inspect {
        task_id: String,
        #[arg(long, default_value_t = false)]
        history: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let process = match cli.command {
        Command::Inspect { .. } => ProcessKind::Inspect,
        _ => ProcessKind::Engine,
    };
    let (_log_guard, log_info) = init_process_logging(process, &logs_dir, 14)?;
    let detail = format!("{} pruned={}", log_info.logs_dir, log_info.pruned_files);
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some(&detail),
            ..Default::default()
        },
    );

    match cli.command {
        Command::Run {
            task,
            script,
            workspace,
            config,
            auto_approve,
            allow,
            mode,
            yes,
        } => {
            let overrides = build_cli_overrides(auto_approve, &allow, mode.as_deref())?;
            let (services, config) =
                build_services(&state_dir, &script, workspace, config, overrides).await?;
            let console = spawn_console(services.host.clone(), yes);
            spawn_interrupt_handler(services.cancellations.clone());

            let mut runner = Task::new(services, config).await;
            info!(task_id = %runner.id(), "starting task");
            let outcome = runner.start(&task, Vec::new()).await;
            console.abort();
            report_outcome(runner.id(), outcome?)
        }
        Command::Resume {
            task_id,
            script,
            workspace,
            config,
            yes,
        } => {
            let (services, config) =
                build_services(&state_dir, &script, workspace, config, None).await?;
            let console = spawn_console(services.host.clone(), yes);
            spawn_interrupt_handler(services.cancellations.clone());

            let mut runner = Task::resume(services, config, &task_id).await?;
            info!(task_id = %runner.id(), "resuming task");
            let outcome = runner.resume_run().await;
            console.abort();
            report_outcome(runner.id(), outcome?)
        }
        Command::Inspect { task_id, history } => {
            let store = FileTaskStore::new(state_dir.join("storage")).await?;
            let snapshot = store
                .load(&task_id)
                .await?
                .with_context(|| format!("task `{task_id}` not found"))?;
            let value = if history {
                serde_json::to_value(&snapshot.history)?
            } else {
                serde_json::to_value(&snapshot.transcript)?
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
    }
}

async fn build_services(
    state_dir: &Path,
    script: &Path,
    workspace: Option<PathBuf>,
    config_path: Option<PathBuf>,
    overrides: Option<Value>,
) -> anyhow::Result<(TaskServices, EngineConfig)> {
    let workspace = match workspace {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let config_path = config_path.unwrap_or_else(|| workspace.join(".tether").join("config.json"));
    let config = ConfigStore::new(&config_path, overrides).await?.get();

    let provider = ScriptedProvider::from_json_file(script)
        .with_context(|| format!("loading script {}", script.display()))?;
    let store = FileTaskStore::new(state_dir.join("storage")).await?;
    let tools = ToolRegistry::with_workspace_tools(Workspace::new(workspace.clone()));
    let prompt = system_prompt(&tools, &workspace).await;

    let host = ApprovalHost::new(EventBus::new());
    let services = TaskServices::new(Arc::new(provider), tools, Arc::new(store), host)
        .with_system_prompt(prompt);
    Ok((services, config))
}

fn build_cli_overrides(
    auto_approve: bool,
    allow: &[String],
    mode: Option<&str>,
) -> anyhow::Result<Option<Value>> {
    let mode = mode
        .map(|raw| raw.parse::<Mode>().map_err(anyhow::Error::msg))
        .transpose()?;
    if !auto_approve && allow.is_empty() && mode.is_none() {
        return Ok(None);
    }

    let mut root = Map::new();
    if let Some(mode) = mode {
        root.insert("mode".to_string(), Value::String(mode.as_str().to_string()));
    }
    // Naming a category implies turning auto-approval on.
    if auto_approve || !allow.is_empty() {
        let mut approval = Map::new();
        approval.insert("enabled".to_string(), Value::Bool(true));
        for category in allow {
            approval.insert(normalize_category(category)?, Value::Bool(true));
        }
        root.insert("auto_approval".to_string(), Value::Object(approval));
    }
    Ok(Some(Value::Object(root)))
}

fn normalize_category(category: &str) -> anyhow::Result<String> {
    let normalized = category.trim().to_lowercase().replace('-', "_");
    if APPROVAL_CATEGORIES.contains(&normalized.as_str()) {
        return Ok(normalized);
    }
    anyhow::bail!(
        "unknown approval category `{}`. supported categories: {}",
        category,
        APPROVAL_CATEGORIES.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("TETHER_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
}

async fn system_prompt(tools: &ToolRegistry, workspace: &Path) -> String {
    let mut available = tools.list().await;
    available.extend([
        ToolId::AskFollowupQuestion,
        ToolId::AttemptCompletion,
        ToolId::SwitchMode,
        ToolId::PlanModeRespond,
    ]);
    let mut prompt = format!(
        "You are a software engineering agent working in {}.\n\n\
         Use exactly one tool per message, written as XML-style tags, and wait for its result \
         before continuing. Finish with attempt_completion.\n\nTools:\n",
        workspace.display()
    );
    for tool in available {
        let params = tool
            .params()
            .iter()
            .map(|param| format!("<{param}>…</{param}>"))
            .collect::<String>();
        prompt.push_str(&format!("- <{tool}>{params}</{tool}>\n"));
    }
    prompt
}

fn spawn_interrupt_handler(cancellations: CancellationRegistry) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let aborted = cancellations.cancel_all().await;
            tracing::warn!(aborted, "interrupted, aborting running tasks");
        }
    });
}

/// Prints finished transcript entries and answers asks from stdin.
fn spawn_console(host: ApprovalHost, auto_yes: bool) -> JoinHandle<()> {
    let mut events = host.event_bus().subscribe();
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut printed = HashSet::new();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "console lagged behind the event bus");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event.event_type.as_str() {
                "transcript.appended" | "transcript.updated" => print_entry(&event, &mut printed),
                "ask.pending" => {
                    let Ok(ask) = serde_json::from_value::<PendingAsk>(event.properties) else {
                        continue;
                    };
                    let reply = if auto_yes {
                        println!("[{}] auto-approved", kind_label(EntryKind::Ask(ask.kind)));
                        AskReply::yes()
                    } else {
                        prompt_user(&ask, &mut stdin).await
                    };
                    host.reply(&ask.task_id, ask.ts, reply).await;
                }
                _ => {}
            }
        }
    })
}

fn print_entry(event: &EngineEvent, printed: &mut HashSet<i64>) {
    let Some(entry) = event
        .properties
        .get("entry")
        .cloned()
        .and_then(|value| serde_json::from_value::<TranscriptEntry>(value).ok())
    else {
        return;
    };
    let skip = entry.partial
        || matches!(entry.kind, EntryKind::Ask(_))
        || entry.is_say(SayKind::ApiReqStarted);
    if skip || !printed.insert(entry.ts) {
        return;
    }
    println!(
        "[{}] {}",
        kind_label(entry.kind),
        entry.text.as_deref().unwrap_or_default()
    );
}

async fn prompt_user(ask: &PendingAsk, stdin: &mut Lines<BufReader<Stdin>>) -> AskReply {
    println!(
        "[{}] {}",
        kind_label(EntryKind::Ask(ask.kind)),
        ask.text.as_deref().unwrap_or_default()
    );
    println!("answer y / n, or type feedback:");
    match stdin.next_line().await {
        Ok(Some(line)) => parse_answer(ask.kind, &line),
        Ok(None) | Err(_) => AskReply::no(),
    }
}

fn parse_answer(kind: AskKind, line: &str) -> AskReply {
    let line = line.trim();
    if line.is_empty() {
        return AskReply::yes();
    }
    if matches!(kind, AskKind::Followup | AskKind::PlanModeRespond) {
        return AskReply::message(line);
    }
    match line.to_lowercase().as_str() {
        "y" | "yes" => AskReply::yes(),
        "n" | "no" => AskReply::no(),
        _ => AskReply::message(line),
    }
}

fn kind_label(kind: EntryKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|value| value.get("kind").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "entry".to_string())
}

fn report_outcome(task_id: &str, outcome: TaskOutcome) -> anyhow::Result<()> {
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "task.outcome",
            component: "engine.main",
            task_id: Some(task_id),
            status: Some(match &outcome {
                TaskOutcome::Completed { .. } => "completed",
                TaskOutcome::Aborted => "aborted",
                TaskOutcome::Stopped => "stopped",
                TaskOutcome::Failed { .. } => "failed",
            }),
            ..Default::default()
        },
    );
    let mut report = serde_json::to_value(&outcome)?;
    if let Value::Object(map) = &mut report {
        map.insert("taskID".to_string(), Value::String(task_id.to_string()));
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_enables_auto_approval_per_category() {
        let overrides = build_cli_overrides(false, &["Read".to_string(), "external-tool".to_string()], None)
            .unwrap()
            .unwrap();
        assert_eq!(overrides["auto_approval"]["enabled"], Value::Bool(true));
        assert_eq!(overrides["auto_approval"]["read"], Value::Bool(true));
        assert_eq!(overrides["auto_approval"]["external_tool"], Value::Bool(true));
        assert!(overrides.get("mode").is_none());
    }

    #[test]
    fn no_flags_means_no_overrides() {
        assert!(build_cli_overrides(false, &[], None).unwrap().is_none());
    }

    #[test]
    fn mode_override_is_validated() {
        let overrides = build_cli_overrides(false, &[], Some("PLAN")).unwrap().unwrap();
        assert_eq!(overrides["mode"], Value::String("plan".to_string()));
        assert!(build_cli_overrides(false, &[], Some("review")).is_err());
    }

    #[test]
    fn unknown_category_is_rejected() {
        let err = build_cli_overrides(true, &["network".to_string()], None).unwrap_err();
        assert!(err.to_string().contains("supported categories"));
    }

    #[test]
    fn answers_map_to_replies() {
        assert_eq!(parse_answer(AskKind::Tool, ""), AskReply::yes());
        assert_eq!(parse_answer(AskKind::Tool, " Y "), AskReply::yes());
        assert_eq!(parse_answer(AskKind::Command, "no"), AskReply::no());
        assert_eq!(
            parse_answer(AskKind::Tool, "use a smaller diff"),
            AskReply::message("use a smaller diff")
        );
        assert_eq!(parse_answer(AskKind::Followup, "yes"), AskReply::message("yes"));
    }

    #[test]
    fn explicit_state_dir_wins() {
        assert_eq!(
            resolve_state_dir(Some("/tmp/tether-state".to_string())),
            PathBuf::from("/tmp/tether-state")
        );
    }

    #[test]
    fn entry_labels_use_wire_names() {
        assert_eq!(kind_label(EntryKind::Say(SayKind::CompletionResult)), "completion_result");
        assert_eq!(kind_label(EntryKind::Ask(AskKind::Followup)), "followup");
    }
}
