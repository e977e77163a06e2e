#![allow(clippy::module_name_repetitions)]
//! Small utilities: shell quoting, process execution, id encoding, text builders.

pub mod exec;
pub mod id;
pub mod shell_script;
pub mod text_lines;

pub use exec::{CommandRunner, ExecOutput, ExecRequest, ProcessRunner};
pub use shell_script::ShellScript;
pub use text_lines::TextLines;

/// Reject values containing newline, carriage return or NUL before they reach a command line.
pub fn reject_newlines(s: &str, what: &str) -> Result<(), String> {
    if s.contains(['\n', '\r', '\0']) {
        Err(format!("refusing to pass {what}: contains newline or NUL"))
    } else {
        Ok(())
    }
}

pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_escape(a))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_=./:@,+%".contains(c))
    {
        s.to_string()
    } else {
        let escaped = s.replace('\'', "'\"'\"'");
        format!("'{}'", escaped)
    }
}

/// Last path component, ignoring trailing slashes.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Parse a boolean the way the command line accepts it.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}
