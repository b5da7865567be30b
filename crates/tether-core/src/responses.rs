//! Text fed back to the model when the loop has to correct or inform it.

use tether_types::{ToolId, ToolParam};

use crate::mode::Mode;

pub fn no_tools_used() -> String {
    "[ERROR] You did not use a tool in your previous response! Please retry with a tool use.\n\n\
     Every response must invoke exactly one tool, written as XML-style tags:\n\n\
     <tool_name>\n<parameter_name>value</parameter_name>\n</tool_name>\n\n\
     If the task is done, use attempt_completion. If you need more information from the user, \
     use ask_followup_question."
        .to_string()
}

pub fn tool_denied() -> String {
    "The user denied this operation.".to_string()
}

pub fn tool_denied_with_feedback(feedback: &str) -> String {
    format!(
        "The user denied this operation and provided the following feedback:\n<feedback>\n{feedback}\n</feedback>"
    )
}

pub fn tool_approved_with_feedback(feedback: &str) -> String {
    format!("The user approved this operation and added:\n<feedback>\n{feedback}\n</feedback>")
}

pub fn tool_error(message: &str) -> String {
    format!("The tool execution failed with the following error:\n<error>\n{message}\n</error>")
}

pub fn missing_param(tool: ToolId, param: ToolParam) -> String {
    tool_error(&format!(
        "Missing value for required parameter '{param}' of {tool}. Please retry with a complete response."
    ))
}

pub fn tool_unavailable(tool: ToolId) -> String {
    tool_error(&format!("Tool `{tool}` is not available in this environment."))
}

pub fn tool_disabled(tool: ToolId) -> String {
    tool_error(&format!("Tool `{tool}` has been disabled by the user's settings."))
}

pub fn mode_forbids(tool: ToolId, mode: Mode) -> String {
    tool_error(&format!(
        "Tool `{tool}` cannot be used in {mode} mode. Use switch_mode to change modes first, \
         or continue with a tool this mode allows."
    ))
}

pub fn skipped_after_rejection(tool: ToolId) -> String {
    format!("Skipping tool [{tool}] due to user rejecting a previous tool.")
}

pub fn skipped_one_tool_per_message(tool: ToolId) -> String {
    format!(
        "Tool [{tool}] was not executed because a tool has already been used in this message. \
         Only one tool may be used per message. You must assess the first tool's result before \
         proceeding to use the next tool."
    )
}

pub fn repeated_tool(tool: ToolId) -> String {
    tool_error(&format!(
        "Tool `{tool}` was called with identical parameters too many times in a row. \
         Try a different approach."
    ))
}

pub fn too_many_mistakes(feedback: &str) -> String {
    format!(
        "You seem to be having trouble proceeding. The user has provided the following feedback \
         to help guide you:\n<feedback>\n{feedback}\n</feedback>"
    )
}

pub fn interrupted_tool_result() -> String {
    "Tool execution was interrupted and not completed.".to_string()
}

pub fn no_tool_output() -> String {
    "(tool did not return anything)".to_string()
}

pub fn followup_answer(answer: &str) -> String {
    format!("<answer>\n{answer}\n</answer>")
}

pub fn plan_mode_answer(answer: &str) -> String {
    format!("<user_message>\n{answer}\n</user_message>")
}

pub fn plan_mode_acknowledged() -> String {
    "The user read your plan without comment. Keep refining it, or use switch_mode to move to \
     act mode when the plan is ready to carry out."
        .to_string()
}

pub fn completion_feedback(feedback: &str) -> String {
    format!(
        "The user has provided feedback on the results. Consider their input to continue the \
         task, and then attempt completion again.\n<feedback>\n{feedback}\n</feedback>"
    )
}

pub fn mode_switched(from: Mode, to: Mode, reason: Option<&str>) -> String {
    match reason.filter(|r| !r.trim().is_empty()) {
        Some(reason) => format!("Switched from {from} mode to {to} mode because: {reason}"),
        None => format!("Switched from {from} mode to {to} mode."),
    }
}

pub fn task_resumption(ago: &str, mode: Mode, was_completed: bool) -> String {
    let state = if was_completed {
        "The task was marked complete before it was interrupted; the user wants to continue it."
    } else {
        "It may or may not be complete, so please reassess the task context."
    };
    format!(
        "[TASK RESUMPTION] This task was interrupted {ago}. {state} The current working directory \
         may have changed since then. Tool uses that did not finish were reported as interrupted. \
         Current mode: {mode}."
    )
}

pub fn new_instructions(feedback: &str) -> String {
    format!("New instructions for task continuation:\n<user_message>\n{feedback}\n</user_message>")
}

pub fn response_interrupted_by_user() -> &'static str {
    "[Response interrupted by user]"
}

pub fn response_interrupted_by_rejection() -> &'static str {
    "[Response interrupted by user feedback]"
}

pub fn response_interrupted_by_api_error() -> &'static str {
    "[Response interrupted by API Error]"
}

pub fn response_interrupted_by_size() -> &'static str {
    "[Response cut off: too large]"
}

pub fn response_too_large(detail: &str) -> String {
    format!(
        "[ERROR] Your previous response was too large to process ({detail}) and was cut off. \
         Break the work into smaller steps and use one tool per response, writing large files \
         in parts with replace_in_file."
    )
}

/// "3 minutes ago" style rendering for the resumption note.
pub fn format_elapsed(elapsed_ms: i64) -> String {
    let seconds = elapsed_ms.max(0) / 1_000;
    let (value, unit) = match seconds {
        s if s < 60 => return "just now".to_string(),
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s => (s / 86_400, "day"),
    };
    let plural = if value == 1 { "" } else { "s" };
    format!("{value} {unit}{plural} ago")
}
