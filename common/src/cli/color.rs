//! Color policy for log output.
//!
//! `--color` beats the `color` settings key, which beats the environment.
//! In `auto`, `NO_COLOR` or `EMACS` turn colors off, and otherwise colors
//! follow whether stderr is a terminal.

use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorWhen {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorWhen {
    // ---
    /// Whether log lines written to stderr should carry ANSI escapes.
    pub fn should_color_stderr(self) -> bool {
        // ---
        self.decide(env_suppresses_color(), atty::is(atty::Stream::Stderr))
    }

    fn decide(self, suppressed: bool, is_terminal: bool) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !suppressed && is_terminal,
        }
    }
}

fn env_suppresses_color() -> bool {
    ["NO_COLOR", "EMACS"]
        .iter()
        .any(|name| env::var_os(name).is_some())
}

impl FromStr for ColorWhen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ColorWhen::Auto),
            "always" => Ok(ColorWhen::Always),
            "never" => Ok(ColorWhen::Never),
            other => Err(format!("invalid color choice: {other} (expected auto, always or never)")),
        }
    }
}
