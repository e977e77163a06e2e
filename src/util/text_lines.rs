use std::io;

/// Builder for text files pushed into containers (systemd units, drop-ins, sudoers).
///
/// Invariants:
/// - Each pushed line must not contain `\n`, `\r`, or `\0`.
/// - `build()` joins lines with `\n` and ensures a trailing `\n` when non-empty.
#[derive(Debug, Default)]
pub struct TextLines {
    lines: Vec<String>,
}

impl TextLines {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    /// Push one logical line (no embedded CR/LF/NUL).
    pub fn push(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push(line.into());
        self
    }

    /// Start an INI-style `[Section]` header, preceded by a blank line unless first.
    pub fn section(&mut self, name: &str) -> &mut Self {
        if !self.lines.is_empty() {
            self.lines.push(String::new());
        }
        self.lines.push(format!("[{name}]"));
        self
    }

    pub fn kv(&mut self, key: &str, value: impl AsRef<str>) -> &mut Self {
        self.lines.push(format!("{}={}", key, value.as_ref()));
        self
    }

    pub fn build(&self) -> io::Result<String> {
        if let Some(i) = self.lines.iter().position(|l| l.contains(['\n', '\r', '\0'])) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("text line {i} contains a newline or NUL"),
            ));
        }
        Ok(self.lines.iter().map(|l| format!("{l}\n")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_empty_is_empty() {
        assert_eq!(TextLines::new().build().unwrap(), "");
    }

    #[test]
    fn sections_are_separated_by_blank_lines() {
        let mut t = TextLines::new();
        t.section("Unit").kv("Description", "x").section("Install").kv("WantedBy", "default.target");
        assert_eq!(
            t.build().unwrap(),
            "[Unit]\nDescription=x\n\n[Install]\nWantedBy=default.target\n"
        );
    }

    #[test]
    fn embedded_line_breaks_are_rejected() {
        let mut t = TextLines::new();
        t.section("Socket").kv("ListenStream", "a\nExecStart=/bin/sh");
        let err = t.build().unwrap_err();
        assert_eq!(err.to_string(), "text line 1 contains a newline or NUL");
    }
}
