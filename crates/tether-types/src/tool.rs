use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Every tool the model may invoke. The set is closed: the parser only
/// recognizes these tag names and the orchestrator matches on them exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolId {
    ReadFile,
    WriteToFile,
    ReplaceInFile,
    ExecuteCommand,
    ListFiles,
    SearchFiles,
    ListCodeDefinitionNames,
    BrowserAction,
    AskFollowupQuestion,
    AttemptCompletion,
    UseMcpTool,
    AccessMcpResource,
    SwitchMode,
    NewTask,
    /// Plan mode's conversational reply.
    PlanModeRespond,
}

/// Approval category a tool falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Edit,
    Execute,
    Browse,
    ExternalTool,
    /// Conversation-level tools. Never auto-approved.
    Interaction,
}

impl ToolId {
    pub const ALL: [ToolId; 15] = [
        ToolId::ReadFile,
        ToolId::WriteToFile,
        ToolId::ReplaceInFile,
        ToolId::ExecuteCommand,
        ToolId::ListFiles,
        ToolId::SearchFiles,
        ToolId::ListCodeDefinitionNames,
        ToolId::BrowserAction,
        ToolId::AskFollowupQuestion,
        ToolId::AttemptCompletion,
        ToolId::UseMcpTool,
        ToolId::AccessMcpResource,
        ToolId::SwitchMode,
        ToolId::NewTask,
        ToolId::PlanModeRespond,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolId::ReadFile => "read_file",
            ToolId::WriteToFile => "write_to_file",
            ToolId::ReplaceInFile => "replace_in_file",
            ToolId::ExecuteCommand => "execute_command",
            ToolId::ListFiles => "list_files",
            ToolId::SearchFiles => "search_files",
            ToolId::ListCodeDefinitionNames => "list_code_definition_names",
            ToolId::BrowserAction => "browser_action",
            ToolId::AskFollowupQuestion => "ask_followup_question",
            ToolId::AttemptCompletion => "attempt_completion",
            ToolId::UseMcpTool => "use_mcp_tool",
            ToolId::AccessMcpResource => "access_mcp_resource",
            ToolId::SwitchMode => "switch_mode",
            ToolId::NewTask => "new_task",
            ToolId::PlanModeRespond => "plan_mode_respond",
        }
    }

    /// Parameter names accepted inside this tool's tag.
    pub fn params(self) -> &'static [ToolParam] {
        use ToolParam::*;
        match self {
            ToolId::ReadFile => &[Path],
            ToolId::WriteToFile => &[Path, Content],
            ToolId::ReplaceInFile => &[Path, Diff],
            ToolId::ExecuteCommand => &[Command, RequiresApproval],
            ToolId::ListFiles => &[Path, Recursive],
            ToolId::SearchFiles => &[Path, Regex, FilePattern],
            ToolId::ListCodeDefinitionNames => &[Path],
            ToolId::BrowserAction => &[Action, Url, Coordinate, Text],
            ToolId::AskFollowupQuestion => &[Question, Options],
            ToolId::AttemptCompletion => &[Result, Command],
            ToolId::UseMcpTool => &[ServerName, ToolName, Arguments],
            ToolId::AccessMcpResource => &[ServerName, Uri],
            ToolId::SwitchMode => &[Mode, Reason],
            ToolId::NewTask => &[Context],
            ToolId::PlanModeRespond => &[Response, Options],
        }
    }

    pub fn required_params(self) -> &'static [ToolParam] {
        use ToolParam::*;
        match self {
            ToolId::ReadFile => &[Path],
            ToolId::WriteToFile => &[Path, Content],
            ToolId::ReplaceInFile => &[Path, Diff],
            ToolId::ExecuteCommand => &[Command],
            ToolId::ListFiles => &[Path],
            ToolId::SearchFiles => &[Path, Regex],
            ToolId::ListCodeDefinitionNames => &[Path],
            ToolId::BrowserAction => &[Action],
            ToolId::AskFollowupQuestion => &[Question],
            ToolId::AttemptCompletion => &[Result],
            ToolId::UseMcpTool => &[ServerName, ToolName],
            ToolId::AccessMcpResource => &[ServerName, Uri],
            ToolId::SwitchMode => &[Mode],
            ToolId::NewTask => &[Context],
            ToolId::PlanModeRespond => &[Response],
        }
    }

    pub fn category(self) -> ToolCategory {
        match self {
            ToolId::ReadFile
            | ToolId::ListFiles
            | ToolId::SearchFiles
            | ToolId::ListCodeDefinitionNames => ToolCategory::Read,
            ToolId::WriteToFile | ToolId::ReplaceInFile => ToolCategory::Edit,
            ToolId::ExecuteCommand => ToolCategory::Execute,
            ToolId::BrowserAction => ToolCategory::Browse,
            ToolId::UseMcpTool | ToolId::AccessMcpResource => ToolCategory::ExternalTool,
            ToolId::AskFollowupQuestion
            | ToolId::AttemptCompletion
            | ToolId::SwitchMode
            | ToolId::NewTask
            | ToolId::PlanModeRespond => ToolCategory::Interaction,
        }
    }

    pub fn accepts(self, param: ToolParam) -> bool {
        self.params().contains(&param)
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown tool: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolParam {
    Path,
    Content,
    Diff,
    Command,
    RequiresApproval,
    Recursive,
    Regex,
    FilePattern,
    Action,
    Url,
    Coordinate,
    Text,
    Question,
    Options,
    Result,
    ServerName,
    ToolName,
    Arguments,
    Uri,
    Mode,
    Reason,
    Context,
    Response,
}

impl ToolParam {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolParam::Path => "path",
            ToolParam::Content => "content",
            ToolParam::Diff => "diff",
            ToolParam::Command => "command",
            ToolParam::RequiresApproval => "requires_approval",
            ToolParam::Recursive => "recursive",
            ToolParam::Regex => "regex",
            ToolParam::FilePattern => "file_pattern",
            ToolParam::Action => "action",
            ToolParam::Url => "url",
            ToolParam::Coordinate => "coordinate",
            ToolParam::Text => "text",
            ToolParam::Question => "question",
            ToolParam::Options => "options",
            ToolParam::Result => "result",
            ToolParam::ServerName => "server_name",
            ToolParam::ToolName => "tool_name",
            ToolParam::Arguments => "arguments",
            ToolParam::Uri => "uri",
            ToolParam::Mode => "mode",
            ToolParam::Reason => "reason",
            ToolParam::Context => "context",
            ToolParam::Response => "response",
        }
    }
}

impl fmt::Display for ToolParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
