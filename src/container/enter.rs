//! Assembly of the `incus exec ... su -l ...` command used to enter a container.

use super::constants::{ENTER_ENV_SKIP, ENTER_ENV_SKIP_PREFIX};
use crate::bridge::EnvMap;
use crate::util::{reject_newlines, shell_join};

/// Whether a caller variable is forwarded into the session.
pub fn forwardable(key: &str, value: &str) -> bool {
    !key.is_empty()
        && !key.contains('=')
        && !ENTER_ENV_SKIP.contains(&key)
        && !key.starts_with(ENTER_ENV_SKIP_PREFIX)
        && reject_newlines(value, key).is_ok()
}

/// Build the command vector that replaces the client process.
///
/// `su -l` gives a PAM login session; `-w` keeps the forwarded variables alive
/// through it. An empty `command` starts the login shell.
pub fn build_enter_command(
    incus_bin: &str,
    container: &str,
    username: &str,
    command: &[String],
    env: &EnvMap,
) -> Vec<String> {
    let mut argv = vec![
        incus_bin.to_string(),
        "exec".to_string(),
        container.to_string(),
    ];
    let mut kept: Vec<&str> = Vec::new();
    for (key, value) in env {
        if !forwardable(key, value) {
            continue;
        }
        argv.push("--env".to_string());
        argv.push(format!("{key}={value}"));
        kept.push(key);
    }
    argv.push("--".to_string());
    argv.push("su".to_string());
    argv.push("-l".to_string());
    if !kept.is_empty() {
        argv.push("-w".to_string());
        argv.push(kept.join(","));
    }
    if !command.is_empty() {
        argv.push("-c".to_string());
        argv.push(shell_join(command));
    }
    argv.push(username.to_string());
    argv
}
