//! Tracing subscriber initialization for the patchloom binary.
//!
//! Filter priority, highest first:
//!
//! 1. `PATCHLOOM_LOG` (per-target directives, e.g. `patchloom=debug,warn`)
//! 2. `RUST_LOG`
//! 3. CLI flags (`-v` → debug, `-q` → error)
//! 4. `warn`
//!
//! Logs go to stderr so stdout stays clean for reports and JSON output.

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG: &str = "PATCHLOOM_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// Verbose wins when both flags are set.
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    pub const fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::WARN,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Install the global subscriber. Call once, before loading config.
pub fn init_subscriber(verbosity: Verbosity, no_color: bool) {
    let filter = build_env_filter(verbosity, |key| std::env::var(key).ok());

    let stderr_is_tty = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(!no_color && stderr_is_tty)
        .with_target(true)
        .with_level(true);

    // try_init: a second call (tests, embedding) keeps the first subscriber
    let result = if verbosity == Verbosity::Verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.with_timer(fmt::time::uptime()))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.without_time().compact())
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}

fn build_env_filter(verbosity: Verbosity, lookup: impl Fn(&str) -> Option<String>) -> EnvFilter {
    // Unparseable directives fall through rather than failing startup
    for key in [ENV_LOG, "RUST_LOG"] {
        if let Some(directives) = lookup(key) {
            if let Ok(filter) = EnvFilter::try_new(&directives) {
                return filter;
            }
        }
    }

    let level = verbosity.default_level();
    if verbosity == Verbosity::Verbose {
        EnvFilter::new(format!("warn,patchloom={}", level))
    } else {
        EnvFilter::new(level.to_string())
    }
}
