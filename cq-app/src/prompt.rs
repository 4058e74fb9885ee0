/// Builds the system prompt sent on every request. The tool protocol is a
/// single JSON object embedded in the assistant reply; the orchestrator
/// extracts it with [`cq_tools::parse_tool_call`].
pub fn system_prompt(base: &str, workdir: &std::path::Path) -> String {
    format!(
        "{base}\n\n\
Current working directory: {workdir}\n\n\
You can use local tools. To call a tool, include exactly one JSON object in \
your reply, with a \"tool\" field naming the tool and its arguments alongside:\n\
  {{\"tool\": \"terminal\", \"command\": \"ls -la\"}}\n\
  {{\"tool\": \"read_file\", \"path\": \"src/main.rs\"}}\n\
  {{\"tool\": \"write_file\", \"path\": \"notes.md\", \"content\": \"...\"}}\n\
  {{\"tool\": \"fetch_web\", \"url\": \"https://example.com\"}}\n\
  {{\"tool\": \"search_web\", \"query\": \"rust async channels\"}}\n\
  {{\"tool\": \"open_url\", \"url\": \"http://localhost:3000\"}}\n\
  {{\"tool\": \"check_server_status\", \"port\": 3000}}\n\n\
Rules:\n\
- At most one tool call per reply. Text outside the JSON object is shown to the user.\n\
- After a tool runs you will receive its output as a message; use it to continue.\n\
- Never invent tool output. If a command fails, say so and adjust.\n\
- Destructive commands (rm, sudo, chmod, ...) are blocked; do not attempt them.",
        base = base.trim_end(),
        workdir = workdir.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn prompt_includes_base_and_workdir() {
        let prompt = system_prompt("You are a helper.", Path::new("/tmp/project"));
        assert!(prompt.starts_with("You are a helper."));
        assert!(prompt.contains("/tmp/project"));
        assert!(prompt.contains("\"tool\""));
    }

    #[test]
    fn prompt_example_parses_as_tool_call() {
        let prompt = system_prompt("Base.", Path::new("/w"));
        // The terminal example in the prompt must be a valid tool call itself.
        let line = prompt
            .lines()
            .find(|l| l.contains("\"terminal\""))
            .expect("terminal example present");
        let action = cq_tools::parse_tool_call(line).expect("example parses");
        assert!(matches!(action, cq_tools::ToolAction::Terminal { .. }));
    }
}
