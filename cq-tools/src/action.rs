use serde::{Deserialize, Serialize};

/// One structured action extracted from a model response. Produced once by
/// the parser, consumed once by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolAction {
    Terminal { command: String },
    ReadFile { path: String },
    WriteFile { path: String, content: String },
    FetchWeb { url: String },
    SearchWeb { query: String },
    OpenUrl { url: String },
    CheckServerStatus { port: u16 },
}

impl ToolAction {
    /// Short progress line the orchestrator surfaces while the action runs.
    pub fn describe(&self) -> String {
        match self {
            Self::Terminal { command } => format!("Running command: {command}"),
            Self::ReadFile { path } => format!("Reading file: {path}"),
            Self::WriteFile { path, .. } => format!("Writing file: {path}"),
            Self::FetchWeb { url } => format!("Fetching: {url}"),
            Self::SearchWeb { query } => format!("Searching the web: {query}"),
            Self::OpenUrl { url } => format!("Opening: {url}"),
            Self::CheckServerStatus { port } => format!("Checking server on port {port}"),
        }
    }
}
