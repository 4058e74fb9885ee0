use crate::action::ToolAction;
use serde::Deserialize;

/// Raw payload the model is instructed to emit: a `tool` discriminator plus
/// whichever optional fields that tool needs.
#[derive(Debug, Deserialize)]
struct ToolCallPayload {
    tool: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

/// Extract at most one structured action from free-form model output.
///
/// The span from the first `{` to the last `}` is decoded as a single JSON
/// object. Absence of a tool call is a normal outcome: no span, a decode
/// failure (including the merged span of two sibling objects), an
/// unrecognized `tool` value, or a missing mandatory field all yield `None`.
pub fn parse_tool_call(text: &str) -> Option<ToolAction> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let span = &text[start..=end];
    let payload: ToolCallPayload = serde_json::from_str(span).ok()?;

    let action = match payload.tool.as_str() {
        "terminal" => ToolAction::Terminal {
            command: payload.command?,
        },
        "read_file" => ToolAction::ReadFile {
            path: payload.path?,
        },
        "write_file" => ToolAction::WriteFile {
            path: payload.path?,
            content: payload.content?,
        },
        "fetch_web" => ToolAction::FetchWeb { url: payload.url? },
        "search_web" => ToolAction::SearchWeb {
            query: payload.query?,
        },
        "open_url" => ToolAction::OpenUrl { url: payload.url? },
        "check_server_status" => ToolAction::CheckServerStatus {
            port: payload.port?,
        },
        other => {
            tracing::debug!(tool = %other, "unrecognized tool value in model output");
            return None;
        }
    };
    Some(action)
}
