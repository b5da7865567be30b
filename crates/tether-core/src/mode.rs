use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use tether_types::{ToolCategory, ToolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Act,
    /// Discussion only: nothing that edits files or runs commands.
    Plan,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Act => "act",
            Mode::Plan => "plan",
        }
    }

    pub fn allows(self, tool: ToolId) -> bool {
        match self {
            Mode::Act => tool != ToolId::PlanModeRespond,
            Mode::Plan => !matches!(
                tool.category(),
                ToolCategory::Edit | ToolCategory::Execute
            ),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "act" => Ok(Mode::Act),
            "plan" => Ok(Mode::Plan),
            other => Err(format!("unknown mode `{other}`")),
        }
    }
}
