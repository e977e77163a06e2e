//! Logging initialisation.
//!
//! Diagnostics go to stderr through `tracing`; user-facing progress is rendered
//! separately by `ui::progress`. `KAPSULE_LOG` takes an `EnvFilter` directive and
//! wins over `--verbose`.

use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

fn filter_directive(verbose: bool) -> String {
    match env::var("KAPSULE_LOG") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ if verbose => "kapsule=debug".to_string(),
        _ => "warn".to_string(),
    }
}

/// Install the global subscriber once; later calls are no-ops.
pub fn init(verbose: bool) {
    if INIT.get().is_some() {
        return;
    }
    let filter = EnvFilter::try_new(filter_directive(verbose)).unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_ansi(crate::color::color_enabled_stderr());

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        eprintln!("kapsule: logging init skipped (global subscriber already set)");
    }
    let _ = INIT.set(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_crate_level() {
        if env::var("KAPSULE_LOG").is_ok() {
            return;
        }
        assert_eq!(filter_directive(false), "warn");
        assert_eq!(filter_directive(true), "kapsule=debug");
    }
}
