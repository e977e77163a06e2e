use std::io;

/// Builder for one-line scripts run via `sh -c <script> <argv0> <args>...`.
///
/// Invariants:
/// - Fragments must not contain `\n`, `\r` or NUL.
/// - Fragments are joined with `; `, so loop and conditional heads that need a
///   following command (`while ...; do cmd`) belong in the same fragment.
/// - Data never goes into the script text; it is passed as positional arguments.
#[derive(Debug, Default, Clone)]
pub struct ShellScript {
    parts: Vec<String>,
}

impl ShellScript {
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn push(&mut self, fragment: impl Into<String>) -> &mut Self {
        self.parts.push(fragment.into());
        self
    }

    pub fn build(&self) -> io::Result<String> {
        for (i, p) in self.parts.iter().enumerate() {
            if p.contains('\n') || p.contains('\r') || p.contains('\0') {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("shell script fragment {i} contains a newline or NUL"),
                ));
            }
        }
        Ok(self.parts.join("; "))
    }

    /// Full `sh -c` argument vector with `args` bound to `$1..$n`.
    pub fn sh_argv<I>(&self, argv0: &str, args: I) -> io::Result<Vec<String>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            self.build()?,
            argv0.to_string(),
        ];
        argv.extend(args);
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_fragments_with_semicolons() {
        let mut s = ShellScript::new();
        s.push("while [ $# -ge 1 ]; do echo \"$1\"").push("shift").push("done");
        assert_eq!(
            s.build().unwrap(),
            "while [ $# -ge 1 ]; do echo \"$1\"; shift; done"
        );
    }

    #[test]
    fn rejects_multiline_fragment() {
        let mut s = ShellScript::new();
        s.push("echo a\necho b");
        assert!(s.build().is_err());
    }

    #[test]
    fn sh_argv_places_data_after_argv0() {
        let mut s = ShellScript::new();
        s.push("echo \"$1\"");
        let argv = s.sh_argv("sh", vec!["a b".to_string()]).unwrap();
        assert_eq!(argv, vec!["sh", "-c", "echo \"$1\"", "sh", "a b"]);
    }
}
