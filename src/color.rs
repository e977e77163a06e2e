#![allow(clippy::module_name_repetitions)]
//! Color mode configuration and ANSI painting helpers.
//!
//! Precedence: `NO_COLOR`, then `--color`, then `KAPSULE_COLOR`, then TTY detection.
//! Compute the enabled flag once per scope and pass it to `paint`.

use clap::ValueEnum;
use once_cell::sync::OnceCell;

use crate::util::parse_bool;

/// `--color` / `KAPSULE_COLOR` values. Boolean spellings map to always/never.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn enabled(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => is_tty,
        }
    }
}

static COLOR_MODE: OnceCell<ColorMode> = OnceCell::new();

/// First call wins; later calls are ignored.
pub fn set_color_mode(mode: ColorMode) {
    let _ = COLOR_MODE.set(mode);
}

fn parse_color_mode(s: &str) -> Option<ColorMode> {
    if s.trim().eq_ignore_ascii_case("auto") {
        return Some(ColorMode::Auto);
    }
    parse_bool(s).map(|on| if on { ColorMode::Always } else { ColorMode::Never })
}

fn color_enabled_for(is_tty: bool) -> bool {
    // https://no-color.org/
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    COLOR_MODE
        .get()
        .copied()
        .or_else(|| {
            std::env::var("KAPSULE_COLOR")
                .ok()
                .and_then(|v| parse_color_mode(&v))
        })
        .unwrap_or(ColorMode::Auto)
        .enabled(is_tty)
}

pub fn color_enabled_stdout() -> bool {
    color_enabled_for(atty::is(atty::Stream::Stdout))
}

pub fn color_enabled_stderr() -> bool {
    color_enabled_for(atty::is(atty::Stream::Stderr))
}

/// Wrap `s` in `code` when enabled.
pub fn paint(enabled: bool, code: &str, s: &str) -> String {
    if enabled {
        format!("{code}{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

pub const BLUE: &str = "\x1b[34;1m";
pub const CYAN: &str = "\x1b[36;1m";
pub const GREEN: &str = "\x1b[32;1m";
pub const YELLOW: &str = "\x1b[33m";
pub const RED: &str = "\x1b[31;1m";
pub const GRAY: &str = "\x1b[90m";

/// One red line on stderr.
pub fn log_error_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, RED, msg));
}
