use crate::action::ToolAction;

/// Output markers that always force the raw output to be shown. Anything
/// actionable (an error, a denial) must reach the user verbatim.
const ERROR_MARKERS: &[&str] = &[
    "error",
    "failed",
    "failure",
    "blocked",
    "denied",
    "not allowed",
    "timed out",
    "not found",
];

/// Terminal commands whose output is simple and self-describing enough that
/// the model's summary is strictly better than the raw dump. Explicit table
/// so the rule stays unit-testable.
const QUIET_COMMAND_PREFIXES: &[&str] = &[
    "ls ",
    "pwd",
    "cd ",
    "echo ",
    "which ",
    "whoami",
    "clear",
    "cat ",
    "git status",
    "git log",
    "git diff",
    "git branch",
];

/// Decide whether an action's raw output is rendered to the user or only
/// forwarded to the model as hidden context.
pub fn should_show_output(action: &ToolAction, output: &str) -> bool {
    let lowered = output.to_lowercase();
    if ERROR_MARKERS.iter().any(|m| lowered.contains(m)) {
        return true;
    }

    match action {
        // Folded into the model's next answer instead.
        ToolAction::ReadFile { .. } | ToolAction::WriteFile { .. } | ToolAction::FetchWeb { .. } => {
            false
        }
        // Search results and server checks are things the user verifies.
        ToolAction::SearchWeb { .. }
        | ToolAction::OpenUrl { .. }
        | ToolAction::CheckServerStatus { .. } => true,
        ToolAction::Terminal { command } => {
            let normalized = command.trim().to_lowercase();
            !QUIET_COMMAND_PREFIXES.iter().any(|prefix| {
                normalized == prefix.trim() || normalized.starts_with(prefix)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminal(command: &str) -> ToolAction {
        ToolAction::Terminal {
            command: command.to_string(),
        }
    }

    #[test]
    fn errors_are_always_shown() {
        let action = ToolAction::ReadFile {
            path: "x".to_string(),
        };
        assert!(should_show_output(&action, "File not found: x"));
        assert!(should_show_output(&terminal("ls"), "Blocked: denied"));
    }

    #[test]
    fn simple_commands_are_hidden() {
        for command in ["ls", "ls -la", "pwd", "git status", "git log --oneline"] {
            assert!(
                !should_show_output(&terminal(command), "some listing"),
                "{command} should be quiet"
            );
        }
    }

    #[test]
    fn quiet_prefixes_do_not_swallow_longer_commands() {
        assert!(!should_show_output(&terminal("ls"), "a.txt"));
        assert!(!should_show_output(&terminal("ls -la src"), "a.txt"));
        assert!(should_show_output(
            &terminal("lsof -i :3000"),
            "node 1234 ..."
        ));
    }

    #[test]
    fn informative_commands_are_shown() {
        for command in ["npm install", "cargo test", "make", "curl https://example.com"] {
            assert!(
                should_show_output(&terminal(command), "lots of build output"),
                "{command} should be shown"
            );
        }
    }

    #[test]
    fn reads_writes_and_fetches_are_hidden() {
        let read = ToolAction::ReadFile {
            path: "a".to_string(),
        };
        let write = ToolAction::WriteFile {
            path: "a".to_string(),
            content: "b".to_string(),
        };
        let fetch = ToolAction::FetchWeb {
            url: "https://example.com".to_string(),
        };
        assert!(!should_show_output(&read, "contents"));
        assert!(!should_show_output(&write, "Wrote 2 bytes to a"));
        assert!(!should_show_output(&fetch, "<html></html>"));
    }

    #[test]
    fn search_and_server_checks_are_shown() {
        let search = ToolAction::SearchWeb {
            query: "q".to_string(),
        };
        let check = ToolAction::CheckServerStatus { port: 3000 };
        assert!(should_show_output(&search, "1. result"));
        assert!(should_show_output(&check, "listening"));
    }
}
