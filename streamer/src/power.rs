//! Sleep prevention while a stream is active.
//!
//! The lease is a child process that holds the platform's sleep inhibitor
//! (`caffeinate` on macOS, `systemd-inhibit` on Linux) and is killed when
//! the lease is dropped. Failing to take it is never fatal: audio still
//! flows, the machine may just doze off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const PID_PLACEHOLDER: &str = "{pid}";

/// How to keep the machine awake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SleepInhibitor {
    // ---
    Disabled,

    /// Long-running command whose lifetime is the lease. `{pid}` in any
    /// argument is replaced with the current process id.
    Command { program: String, args: Vec<String> },
}

impl SleepInhibitor {
    // ---
    /// The inhibitor for the current platform, or `Disabled` where none
    /// is known.
    pub fn platform_default() -> Self {
        // ---
        if cfg!(target_os = "macos") {
            Self::from_argv(["caffeinate", "-i", "-w", PID_PLACEHOLDER])
        } else if cfg!(target_os = "linux") {
            Self::from_argv([
                "systemd-inhibit",
                "--what=sleep:idle",
                "--who=raop-streamer",
                "--why=Streaming audio",
                "--mode=block",
                "tail",
                "--pid",
                PID_PLACEHOLDER,
                "-f",
                "/dev/null",
            ])
        } else {
            Self::Disabled
        }
    }

    /// Builds a command inhibitor from an argv list; empty means disabled.
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // ---
        let mut argv = argv.into_iter().map(Into::into);
        match argv.next() {
            Some(program) => Self::Command {
                program,
                args: argv.collect(),
            },
            None => Self::Disabled,
        }
    }

    /// Takes a lease. `held` reflects whether a lease is active and is
    /// cleared again when the lease is dropped.
    pub fn acquire(&self, held: Arc<AtomicBool>) -> SleepLease {
        // ---
        let Self::Command { program, args } = self else {
            return SleepLease { child: None, held };
        };

        let pid = std::process::id().to_string();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.replace(PID_PLACEHOLDER, &pid))
            .collect();

        match Command::new(program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                debug!("Sleep lease taken via {} (pid {:?})", program, child.id());
                held.store(true, Ordering::Release);
                SleepLease {
                    child: Some(child),
                    held,
                }
            }
            Err(e) => {
                warn!("Could not start {} to prevent sleep: {}", program, e);
                SleepLease { child: None, held }
            }
        }
    }
}

/// An active (or failed, empty) sleep-prevention lease.
#[derive(Debug)]
pub struct SleepLease {
    // ---
    child: Option<Child>,
    held: Arc<AtomicBool>,
}

impl SleepLease {
    // ---
    pub fn is_held(&self) -> bool {
        self.child.is_some()
    }
}

impl Drop for SleepLease {
    fn drop(&mut self) {
        // ---
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!("Sleep lease process already gone: {}", e);
            }
        }
        self.held.store(false, Ordering::Release);
    }
}
