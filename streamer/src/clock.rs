//! Pacing clock and the process lock that guards it.
//!
//! Only one session per machine may drive a receiver clock at a time. The
//! lock is a file created with `create_new`, holding the owner's PID; it is
//! removed when the clock is dropped. A crash leaves it behind, which is what
//! [`cleanup_stale_lock`] is for.

use raop_common::alac::FRAMES_PER_PACKET;
use raop_common::pcm::RAOP_SAMPLE_RATE;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

const LOCK_FILE_NAME: &str = "raop-streamer.lock";

/// `<temp_dir>/raop-streamer.lock`
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join(LOCK_FILE_NAME)
}

/// Removes a lock artifact left behind by a previous run.
///
/// Returns whether a file was removed. Calling it when nothing is there is
/// fine, and so is calling it twice.
pub fn cleanup_stale_lock(path: &Path) -> io::Result<bool> {
    // ---
    match fs::remove_file(path) {
        Ok(()) => {
            info!("Removed stale lock {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// [`cleanup_stale_lock`] on [`default_lock_path`].
pub fn cleanup_default_stale_lock() -> io::Result<bool> {
    cleanup_stale_lock(&default_lock_path())
}

/// Exclusive hold on the lock artifact. Dropping it removes the file.
#[derive(Debug)]
pub struct ClockLock {
    // ---
    path: PathBuf,
}

impl ClockLock {
    // ---
    /// Creates the lock file.
    ///
    /// Fails with `ResourceBusy` if the file exists and with `LockFailed`
    /// if it cannot be created at all (missing directory, permissions).
    pub fn acquire(path: &Path) -> Result<Self> {
        // ---
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let owner = fs::read_to_string(path).unwrap_or_default();
                return Err(SessionError::ResourceBusy(format!(
                    "{} is held by pid {}",
                    path.display(),
                    owner.trim()
                )));
            }
            Err(e) => {
                return Err(SessionError::LockFailed(format!(
                    "cannot create {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        if let Err(e) = writeln!(file, "{}", std::process::id()) {
            warn!("Lock {} created but PID not written: {}", path.display(), e);
        }

        debug!("Acquired clock lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ClockLock {
    fn drop(&mut self) {
        // ---
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released clock lock {}", self.path.display()),
            Err(e) => warn!("Failed to remove lock {}: {}", self.path.display(), e),
        }
    }
}

/// Monotonic schedule for outgoing audio packets.
///
/// Packet `n` is due at `origin + n * 352 / 44100 s - lead`. Deadlines are
/// absolute, so a late wakeup shortens the following interval instead of
/// pushing every later packet back.
#[derive(Debug)]
pub struct PacingClock {
    // ---
    origin: Instant,
    lead: Duration,
    _lock: ClockLock,
    open: Arc<AtomicBool>,
}

impl PacingClock {
    // ---
    /// Takes the lock at `lock_path` and opens the clock.
    ///
    /// `open` is set while the clock exists and cleared when it is dropped.
    pub fn open(lock_path: &Path, lead: Duration, open: Arc<AtomicBool>) -> Result<Self> {
        // ---
        let lock = ClockLock::acquire(lock_path)?;
        open.store(true, Ordering::Release);

        Ok(Self {
            origin: Instant::now(),
            lead,
            _lock: lock,
            open,
        })
    }

    /// Length of one packet of audio.
    pub fn packet_duration() -> Duration {
        Duration::from_secs_f64(FRAMES_PER_PACKET as f64 / RAOP_SAMPLE_RATE as f64)
    }

    /// Restarts the schedule with packet 0 due now.
    pub fn reset(&mut self) {
        self.origin = Instant::now();
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// When packet `index` should leave.
    pub fn deadline(&self, index: u64) -> Instant {
        // ---
        let offset = Duration::from_secs_f64(
            index as f64 * FRAMES_PER_PACKET as f64 / RAOP_SAMPLE_RATE as f64,
        );
        self.origin + offset.saturating_sub(self.lead)
    }

    /// How late `now` is relative to the deadline of packet `index`.
    pub fn drift(&self, index: u64, now: Instant) -> Duration {
        now.saturating_duration_since(self.deadline(index))
    }
}

impl Drop for PacingClock {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let lock = ClockLock::acquire(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        assert!(matches!(
            ClockLock::acquire(&path),
            Err(SessionError::ResourceBusy(_))
        ));

        drop(lock);
        assert!(!path.exists());
        assert!(ClockLock::acquire(&path).is_ok());
    }

    #[test]
    fn unwritable_location_is_not_reported_busy() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("test.lock");

        let result = ClockLock::acquire(&path);
        assert!(matches!(result, Err(SessionError::LockFailed(_))), "{:?}", result);
        assert!(!path.exists());
    }

    #[test]
    fn stale_cleanup_is_idempotent() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.lock");
        fs::write(&path, "12345\n").unwrap();

        assert!(cleanup_stale_lock(&path).unwrap());
        assert!(!cleanup_stale_lock(&path).unwrap());
        assert!(ClockLock::acquire(&path).is_ok());
    }

    #[tokio::test]
    async fn deadlines_follow_packet_cadence() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let clock =
            PacingClock::open(&dir.path().join("c.lock"), Duration::ZERO, flag.clone()).unwrap();

        let step = clock.deadline(1) - clock.deadline(0);
        assert_eq!(step, PacingClock::packet_duration());

        // 125 packets of 352 frames is 44000 frames, just under a second
        let d = clock.deadline(125) - clock.origin();
        assert!((d.as_secs_f64() - 44_000.0 / 44_100.0).abs() < 1e-6);
        assert!(flag.load(Ordering::Acquire));

        drop(clock);
        assert!(!flag.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn lead_moves_deadlines_earlier_but_not_before_origin() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let lead = Duration::from_millis(100);
        let clock = PacingClock::open(&dir.path().join("c.lock"), lead, flag).unwrap();

        assert_eq!(clock.deadline(0), clock.origin());
        assert_eq!(clock.deadline(5), clock.origin());

        let late = clock.deadline(1000) - clock.origin();
        let expected = Duration::from_secs_f64(1000.0 * 352.0 / 44_100.0) - lead;
        assert!((late.as_secs_f64() - expected.as_secs_f64()).abs() < 1e-6);
    }

    #[tokio::test]
    async fn drift_is_zero_when_early() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let clock = PacingClock::open(&dir.path().join("c.lock"), Duration::ZERO, flag).unwrap();

        assert_eq!(clock.drift(10, clock.origin()), Duration::ZERO);
        let late = clock.deadline(2) + Duration::from_millis(3);
        assert_eq!(clock.drift(2, late), Duration::from_millis(3));
    }
}
