use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const OBS_TARGET: &str = "tether.obs";

/// Which binary mode is logging. Each kind rolls its own set of files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Runs or resumes tasks.
    Engine,
    /// Read-only inspection of stored tasks.
    Inspect,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Inspect => "inspect",
        }
    }

    fn file_prefix(self) -> String {
        format!("tether.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: ProcessKind,
    pub logs_dir: String,
    pub file_prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

/// A structured lifecycle event. Unset fields are logged as empty strings so
/// every line has the same shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub task_id: Option<&'a str>,
    pub request_id: Option<&'a str>,
    pub tool: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", trimmed.len(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Cuts `input` to at most `max_chars` characters for log fields.
pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &input[..idx]),
        None => input.to_string(),
    }
}

macro_rules! obs_event {
    ($macro:ident, $process:expr, $event:expr) => {
        tracing::$macro!(
            target: OBS_TARGET,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            task_id = $event.task_id.unwrap_or(""),
            request_id = $event.request_id.unwrap_or(""),
            tool = $event.tool.unwrap_or(""),
            provider_id = $event.provider_id.unwrap_or(""),
            model_id = $event.model_id.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_event!(error, process, event),
        Level::WARN => obs_event!(warn, process, event),
        Level::DEBUG | Level::TRACE => obs_event!(debug, process, event),
        _ => obs_event!(info, process, event),
    }
}

/// Console output on stderr, filtered by `TETHER_LOG` (then `RUST_LOG`,
/// default `warn`), plus a daily JSONL file that always records `info` and
/// every structured event. Files older than `retention_days` are pruned first.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)
        .with_context(|| format!("creating log directory {}", logs_dir.display()))?;
    let file_prefix = process.file_prefix();
    let pruned_files = prune_expired_logs(
        logs_dir,
        &file_prefix,
        Utc::now().date_naive(),
        retention_days,
    )?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&file_prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)
        .context("building the log file appender")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console_filter = EnvFilter::try_from_env("TETHER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let file_filter = EnvFilter::new(format!("info,{OBS_TARGET}=debug"));

    let console = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);
    let file = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false)
        .with_filter(file_filter);

    // A subscriber may already be installed, e.g. by a test harness.
    let _ = tracing_subscriber::registry().with(console).with(file).try_init();

    Ok((
        guard,
        LoggingInitInfo {
            process,
            logs_dir: logs_dir.display().to_string(),
            file_prefix,
            retention_days,
            pruned_files,
            initialized_at: Utc::now(),
        },
    ))
}

/// The day a rolled file belongs to: `<prefix>.YYYY-MM-DD.jsonl`.
fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn prune_expired_logs(
    logs_dir: &Path,
    prefix: &str,
    today: NaiveDate,
    retention_days: u64,
) -> anyhow::Result<usize> {
    let oldest_kept = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(NaiveDate::MIN);
    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| log_file_date(name, prefix))
            .is_some_and(|date| date < oldest_kept);
        if expired && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
