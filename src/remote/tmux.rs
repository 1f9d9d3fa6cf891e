//! tmux command strings for detached execution.
//!
//! Nothing here touches the network; the runner sends these strings over a
//! pooled session and parses the output with the helpers below.

use uuid::Uuid;

use super::error::RemoteError;

/// Prefix for derived session names.
pub const SESSION_PREFIX: &str = "bg_";

/// Builds the tmux and process-control commands the runner dispatches.
#[derive(Debug, Default, Clone, Copy)]
pub struct TmuxCommands;

impl TmuxCommands {
    /// `tmux new-session -d -s <name> <command>`
    ///
    /// Exits 0 only when the session was created.
    pub fn new_session(&self, name: &str, command: &str) -> String {
        format!(
            "tmux new-session -d -s {} {}",
            shell_escape(name),
            shell_escape(command)
        )
    }

    /// `tmux list-panes -s -t =<name> -F '#{pane_pid}'`
    pub fn pane_pid(&self, name: &str) -> String {
        format!(
            "tmux list-panes -s -t {} -F '#{{pane_pid}}'",
            shell_escape(&exact_target(name))
        )
    }

    /// Kill the session and, when given, every process matching `pattern`.
    /// Always exits 0, whether or not anything was running.
    pub fn stop(&self, name: &str, kill_pattern: Option<&str>, sudo: bool) -> String {
        let mut command = format!(
            "tmux kill-session -t {} 2>/dev/null || true",
            shell_escape(&exact_target(name))
        );
        if let Some(pattern) = kill_pattern {
            command.push_str(&format!(
                "; {}pkill -f {} 2>/dev/null || true",
                if sudo { "sudo " } else { "" },
                shell_escape(&self_excluding(pattern))
            ));
        }
        command
    }

    /// Session names, one per line. Empty output when no server runs.
    pub fn list_sessions(&self) -> String {
        "tmux list-sessions -F '#{session_name}' 2>/dev/null || true".to_string()
    }

    /// Exits 0 iff some process command line matches `pattern`.
    pub fn process_check(&self, pattern: &str) -> String {
        format!("pgrep -f {} >/dev/null", shell_escape(&self_excluding(pattern)))
    }
}

/// `bg_` followed by 8 hex characters.
pub fn generate_session_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}{}", SESSION_PREFIX, &id[..8])
}

/// tmux rewrites `.` and `:` in session names, which would make later
/// lookups by the original name miss.
pub fn validate_session_name(name: &str) -> Result<(), RemoteError> {
    if name.is_empty() {
        return Err(RemoteError::Config("session name must not be empty".to_string()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(RemoteError::Config(format!(
            "session name '{}' contains unsupported character {:?}",
            name, c
        )));
    }
    Ok(())
}

/// First pane PID from `list-panes` output.
pub fn parse_pid(stdout: &str) -> Option<u32> {
    stdout.lines().next()?.trim().parse().ok()
}

/// Exact line match against `list-sessions` output.
pub fn session_listed(stdout: &str, name: &str) -> bool {
    stdout.lines().any(|line| line.trim() == name)
}

/// Without the `=` prefix tmux falls back to prefix matching, so `gnb`
/// would resolve to a running `gnb_pmec`.
fn exact_target(name: &str) -> String {
    format!("={}", name)
}

/// Rewrite `main.py` as `[m]ain.py` and `/opt/run.sh` as `/[o]pt/run.sh`:
/// same regex, but the shell running pkill/pgrep no longer matches its own
/// command line.
///
/// The first plain alphanumeric is bracketed. Scanning stops at `[` or `\`,
/// whose contexts a bracket could change; such patterns pass through as is.
fn self_excluding(pattern: &str) -> String {
    for (i, c) in pattern.char_indices() {
        if c == '[' || c == '\\' {
            break;
        }
        if c.is_ascii_alphanumeric() {
            return format!("{}[{}]{}", &pattern[..i], c, &pattern[i + 1..]);
        }
    }
    pattern.to_string()
}

/// Single-quote `s` for a POSIX shell unless it is plainly safe.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '=' | ',')
    }) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
