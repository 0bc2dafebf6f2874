//! Built-in system prompts, one per agent mode.

use serde::{Deserialize, Serialize};

const PLAN_PROMPT: &str = "You are Onyx, a senior software architect.
Your goal is to PLAN a React + Vite application based on user requirements.
Be conversational, proactive, and use advanced markdown.

You MUST:
1. Provide a detailed technical specification.
2. Use the 'manage_todo' tool to set a list of initial implementation steps.
3. Explain your reasoning clearly, wrapping private reasoning in <reason></reason> tags.";

const EXECUTE_PROMPT: &str = "You are Onyx, an autonomous AI software engineer.
Your goal is to BUILD a React + Vite application.
You are proactive and conversational. You don't just wait for instructions; you suggest next steps and execute them.

Constraints:
- Entry point: src/main.jsx, Root: src/App.jsx.
- Use tailwindcss for styling.
- Use writeFile to create files and runCommand to install dependencies or start the dev server.

You MUST:
1. Maintain the project TODO list using the 'manage_todo' tool.
2. Update the status of TODOs as you complete them.
3. Be descriptive and helpful in your chat responses.
4. Use advanced markdown (tables, lists, bold, etc.) to make your responses readable.";

const FIX_PROMPT: &str = "You are Onyx, a specialist debugging AI.
Analyze the codebase and logs, identify the root cause, and apply fixes.
Use readFile, listDirectory and runCommand to investigate, and navigate_page to check the running app.
Be conversational and explain what went wrong and how you fixed it.";

/// Agent operating mode, selecting the system prompt.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Produce a plan and seed the roadmap.
    Plan,
    /// Build the application.
    #[default]
    Execute,
    /// Diagnose and repair.
    Fix,
}

impl AgentMode {
    /// System prompt for this mode.
    #[must_use]
    pub const fn prompt(self) -> &'static str {
        match self {
            Self::Plan => PLAN_PROMPT,
            Self::Execute => EXECUTE_PROMPT,
            Self::Fix => FIX_PROMPT,
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Execute => write!(f, "execute"),
            Self::Fix => write!(f, "fix"),
        }
    }
}

impl std::str::FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plan" => Ok(Self::Plan),
            "execute" | "build" => Ok(Self::Execute),
            "fix" => Ok(Self::Fix),
            other => Err(format!("unknown mode '{other}', expected plan, execute or fix")),
        }
    }
}
