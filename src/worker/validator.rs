use crate::error::{AgentError, Result};

/// Characters that let a `sh -c` line chain, substitute or redirect.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '<', '>', '\n', '\r'];

/// Allow-list and blocked-pattern checks applied before a command is spawned.
///
/// With an allow-list, the program name (the command itself when args are
/// given, otherwise the first word of the shell line) must be listed, and a
/// shell line may not contain operators that would start another program.
/// Blocked patterns are substring matches against the full command line.
#[derive(Debug, Clone, Default)]
pub struct CommandValidator {
    allowed_commands: Vec<String>,
    blocked_patterns: Vec<String>,
}

impl CommandValidator {
    pub fn new(allowed_commands: Vec<String>, blocked_patterns: Vec<String>) -> Self {
        Self {
            allowed_commands,
            blocked_patterns,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.allowed_commands.is_empty() || !self.blocked_patterns.is_empty()
    }

    pub fn validate(&self, command: &str, args: &[String]) -> Result<()> {
        if !self.allowed_commands.is_empty() {
            let program = if args.is_empty() {
                command.split_whitespace().next().unwrap_or_default()
            } else {
                command
            };
            if !self.allowed_commands.iter().any(|c| c == program) {
                return Err(AgentError::CommandRejected(format!(
                    "command {program:?} not in allowed list"
                )));
            }
            if args.is_empty() {
                if let Some(c) = command.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
                    return Err(AgentError::CommandRejected(format!(
                        "shell operator {c:?} not permitted with an allow-list"
                    )));
                }
            }
        }

        let full = if args.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", command, args.join(" "))
        };
        if let Some(pattern) = self
            .blocked_patterns
            .iter()
            .find(|p| full.contains(p.as_str()))
        {
            return Err(AgentError::CommandRejected(format!(
                "command matches blocked pattern {pattern:?}"
            )));
        }

        Ok(())
    }
}
