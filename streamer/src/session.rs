//! One logical RAOP connection to a receiver.

use raop_common::alac::{self, FRAMES_PER_PACKET};
use raop_common::gain::{db_to_linear, scale_samples};
use raop_common::pcm::RAOP_CHANNELS;
use raop_common::{GainControl, MetricsContext, PcmSource, RtpPacket, SessionLink, SyncPacket};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::CaptureSink;
use crate::clock::PacingClock;
use crate::config::SessionConfig;
use crate::control::{self, PLAY_PATH};
use crate::error::{Result, SessionError};
use crate::handshake::{self, Negotiated, StreamStart};
use crate::network::AudioTransport;
use crate::power::{SleepInhibitor, SleepLease};
use crate::rtsp::{ClientIds, RtspClient};

/// A sync packet goes out every this many audio packets.
pub const SYNC_INTERVAL: u64 = 126;

/// Lifecycle of a [`StreamingSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Stopping,
}

/// What a session currently holds. All `false` when idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionResources {
    // ---
    pub clock_open: bool,
    pub transport_open: bool,
    pub sleep_lease_held: bool,
}

impl SessionResources {
    pub fn any(&self) -> bool {
        self.clock_open || self.transport_open || self.sleep_lease_held
    }
}

/// State shared between the session handle and its send loop.
struct Shared {
    // ---
    state: watch::Sender<SessionState>,

    /// f32 bits, dB
    gain_db: AtomicU32,

    packets_sent: AtomicU64,
    last_error: Mutex<Option<SessionError>>,

    clock_open: Arc<AtomicBool>,
    transport_open: Arc<AtomicBool>,
    lease_held: Arc<AtomicBool>,

    /// WAV copy of the outgoing audio, while one is open
    capture: Mutex<Option<CaptureSink>>,
}

impl Shared {
    // ---
    fn set_state(&self, state: SessionState) {
        // ---
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session state {:?} -> {:?}", previous, state);
        }
    }

    fn gain_db(&self) -> f32 {
        f32::from_bits(self.gain_db.load(Ordering::Acquire))
    }

    fn record_error(&self, e: &SessionError) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.clone());
    }

    fn lock_capture(&self) -> MutexGuard<'_, Option<CaptureSink>> {
        self.capture.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Copies post-gain samples to the open capture. A write error closes
    /// the capture; the stream carries on.
    fn capture_samples(&self, pcm: &[i16]) {
        // ---
        let mut slot = self.lock_capture();
        let Some(sink) = slot.as_mut() else {
            return;
        };
        if let Err(e) = sink.write(pcm) {
            warn!("Capture to {} failed, closing it: {}", sink.path().display(), e);
            if let Some(sink) = slot.take() {
                let _ = sink.finish();
            }
        }
    }

    fn finish_capture(&self) -> Result<Option<PathBuf>> {
        // ---
        match self.lock_capture().take() {
            Some(sink) => sink.finish().map(Some),
            None => Ok(None),
        }
    }
}

/// The running half of a session: the send loop task and its stop signal.
struct ActiveStream {
    // ---
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Streams PCM to one RAOP receiver.
///
/// `start` and `stop` are serialized: a `start` while streaming stops the
/// old stream completely before negotiating again, and a `stop` while a
/// `start` is still connecting cancels it. Everything the stream holds
/// (pacing clock and its lock, UDP sockets, the sleep lease) is owned by
/// the send loop and released on every exit path.
///
/// Gain can be changed at any time and takes effect at the next packet.
pub struct StreamingSession {
    // ---
    target: SocketAddr,
    config: SessionConfig,
    ids: ClientIds,
    inhibitor: SleepInhibitor,
    shared: Arc<Shared>,
    active: tokio::sync::Mutex<Option<ActiveStream>>,

    /// Token of a start that is still connecting
    pending: Mutex<Option<CancellationToken>>,

    metrics: Option<MetricsContext>,
}

impl StreamingSession {
    // ---
    /// Creates a session for `ip:port` with default settings. No I/O.
    pub fn new(ip: IpAddr, port: u16, replay_gain_db: f32) -> Self {
        Self::with_config(ip, port, replay_gain_db, SessionConfig::default())
    }

    /// Like [`StreamingSession::new`] from textual address and port.
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` if either does not parse.
    pub fn try_new(ip: &str, port: &str, replay_gain_db: f32) -> Result<Self> {
        // ---
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| SessionError::ConnectionFailed(format!("invalid address {:?}", ip)))?;
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| SessionError::ConnectionFailed(format!("invalid port {:?}", port)))?;
        Ok(Self::new(addr, port, replay_gain_db))
    }

    pub fn with_config(ip: IpAddr, port: u16, replay_gain_db: f32, config: SessionConfig) -> Self {
        // ---
        let inhibitor = if !config.inhibit_sleep {
            SleepInhibitor::Disabled
        } else if let Some(argv) = &config.sleep_command {
            SleepInhibitor::from_argv(argv.iter().cloned())
        } else {
            SleepInhibitor::platform_default()
        };

        let (state, _) = watch::channel(SessionState::Idle);
        let shared = Arc::new(Shared {
            state,
            gain_db: AtomicU32::new(sanitize_gain(replay_gain_db).to_bits()),
            packets_sent: AtomicU64::new(0),
            last_error: Mutex::new(None),
            clock_open: Arc::new(AtomicBool::new(false)),
            transport_open: Arc::new(AtomicBool::new(false)),
            lease_held: Arc::new(AtomicBool::new(false)),
            capture: Mutex::new(None),
        });

        Self {
            target: SocketAddr::new(ip, port),
            config,
            ids: ClientIds::random(),
            inhibitor,
            shared,
            active: tokio::sync::Mutex::new(None),
            pending: Mutex::new(None),
            metrics: None,
        }
    }

    /// Reports into `metrics` from now on.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Non-owning handle for whoever adjusts gain (the decoder).
    pub fn link(self: &Arc<Self>) -> SessionLink {
        // ---
        Arc::downgrade(self) as Weak<dyn GainControl>
    }

    /// Negotiates with the receiver and starts streaming `source`.
    ///
    /// Returns once the receiver accepted RECORD and the send loop runs.
    /// Cancelling `cancel` (or calling [`Self::stop`]) while this is
    /// connecting makes it return `Cancelled` with nothing left held.
    ///
    /// # Errors
    ///
    /// - `InvalidSource` if `source` is not 44.1 kHz stereo
    /// - `ResourceBusy` if another session holds the clock lock
    /// - `ConnectionFailed`, `Timeout`, `ReceiverRejected` from negotiation
    /// - `Cancelled`
    pub async fn start(&self, source: PcmSource, cancel: CancellationToken) -> Result<()> {
        // ---
        if !source.is_raop_format() {
            let e = SessionError::InvalidSource(format!(
                "{} channel(s) at {}Hz, need stereo at 44100Hz",
                source.channels(),
                source.sample_rate()
            ));
            self.shared.record_error(&e);
            return Err(e);
        }

        let mut active = self.active.lock().await;
        if let Some(stream) = active.take() {
            info!("Stopping current stream to {} before restarting", self.target);
            self.finish(stream).await;
        }

        let token = cancel.child_token();
        *self.lock_pending() = Some(token.clone());
        self.shared.set_state(SessionState::Connecting);

        let result = self.connect(source, token).await;
        self.lock_pending().take();

        match result {
            Ok(stream) => {
                *active = Some(stream);
                Ok(())
            }
            Err(e) => {
                match &e {
                    SessionError::Cancelled => info!("Start toward {} cancelled", self.target),
                    _ => error!("Failed to start stream to {}: {}", self.target, e),
                }
                self.shared.record_error(&e);
                self.shared.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    async fn connect(&self, source: PcmSource, token: CancellationToken) -> Result<ActiveStream> {
        // ---
        let lease = self.inhibitor.acquire(self.shared.lease_held.clone());
        let clock = PacingClock::open(
            &self.config.resolved_lock_path(),
            self.config.lead(),
            self.shared.clock_open.clone(),
        )?;

        let start = StreamStart::random();
        let began = Instant::now();
        let negotiation = handshake::negotiate(
            self.target,
            self.ids.clone(),
            start,
            self.shared.transport_open.clone(),
            self.metrics.clone(),
        );
        let timeout = self.config.negotiation_timeout();

        info!("Connecting to {}", self.target);
        let negotiated = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(SessionError::Cancelled),
            outcome = tokio::time::timeout(timeout, negotiation) => match outcome {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SessionError::Timeout(format!(
                        "{} did not complete negotiation within {:?}",
                        self.target, timeout
                    )))
                }
            },
        };

        if let Some(m) = &self.metrics {
            m.negotiation_seconds.observe(began.elapsed().as_secs_f64());
            m.active_sessions.inc();
        }

        let Negotiated {
            rtsp,
            transport,
            latency_frames,
        } = negotiated;

        if let Some(dir) = &self.config.capture_dir {
            if !self.is_capturing() {
                if let Err(e) = self.start_capture(dir) {
                    warn!("Streaming without capture: {}", e);
                }
            }
        }

        let stop = CancellationToken::new();
        let send_loop = SendLoop {
            rtsp,
            transport,
            clock,
            _lease: lease,
            source,
            shared: self.shared.clone(),
            stop: stop.clone(),
            start,
            latency_frames,
            teardown_timeout: self.config.teardown_timeout(),
            metrics: self.metrics.clone(),
        };

        self.shared.packets_sent.store(0, Ordering::Release);
        *self.shared.last_error.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.shared.set_state(SessionState::Streaming);
        info!("Streaming to {}", self.target);

        let task = tokio::spawn(send_loop.run());
        Ok(ActiveStream { stop, task })
    }

    /// Stops streaming and releases everything the stream held.
    ///
    /// Cancels a start that is still connecting. Does nothing when idle.
    pub async fn stop(&self) {
        // ---
        if let Some(token) = self.lock_pending().as_ref() {
            debug!("Cancelling in-flight start");
            token.cancel();
        }

        let mut active = self.active.lock().await;
        match active.take() {
            Some(stream) => self.finish(stream).await,
            None => self.shared.set_state(SessionState::Idle),
        }
    }

    /// Signals the send loop and waits until it has torn down.
    async fn finish(&self, stream: ActiveStream) {
        // ---
        if !stream.task.is_finished() {
            self.shared.set_state(SessionState::Stopping);
        }
        stream.stop.cancel();
        if let Err(e) = stream.task.await {
            error!("Send loop for {} ended abnormally: {}", self.target, e);
        }
        self.shared.set_state(SessionState::Idle);
    }

    /// Sets the gain applied from the next packet on.
    pub fn update_replay_gain(&self, db: f32) {
        // ---
        let db = sanitize_gain(db);
        let previous = f32::from_bits(self.shared.gain_db.swap(db.to_bits(), Ordering::AcqRel));
        if previous != db {
            debug!("Replay gain {:.2} dB -> {:.2} dB", previous, db);
        }
    }

    /// Current gain in dB.
    pub fn gain_db(&self) -> f32 {
        self.shared.gain_db()
    }

    /// Starts writing the outgoing audio to a new WAV file in `dir`.
    ///
    /// May be called while idle or streaming; samples are captured from the
    /// next packet on. A capture ends with the stream it recorded, or
    /// earlier through [`Self::stop_capture`]. An open capture is finished
    /// first.
    ///
    /// # Errors
    ///
    /// `CaptureFailed` if the directory or file cannot be created.
    pub fn start_capture(&self, dir: &Path) -> Result<PathBuf> {
        // ---
        let sink = CaptureSink::create(dir)?;
        let path = sink.path().to_path_buf();

        if let Some(previous) = self.shared.lock_capture().replace(sink) {
            if let Err(e) = previous.finish() {
                warn!("{}", e);
            }
        }
        Ok(path)
    }

    /// Finishes the open capture and returns its path.
    ///
    /// # Errors
    ///
    /// `CaptureFailed` if the WAV header cannot be written.
    pub fn stop_capture(&self) -> Result<Option<PathBuf>> {
        self.shared.finish_capture()
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.lock_capture().is_some()
    }

    /// Asks the receiver to start playback via its DACP control service.
    ///
    /// # Errors
    ///
    /// - `NotConnected` unless streaming
    /// - `ReceiverRejected` on a non-2xx answer
    /// - `Timeout` / `ConnectionFailed` if the control service does not answer
    pub async fn send_play_command(&self) -> Result<()> {
        // ---
        if self.state() != SessionState::Streaming {
            return Err(SessionError::NotConnected);
        }

        let addr = SocketAddr::new(self.target.ip(), self.config.dacp_port);
        control::send_command(
            addr,
            PLAY_PATH,
            &self.ids.active_remote,
            self.config.command_timeout(),
        )
        .await
        .map(|_| ())
        .map_err(|e| {
            warn!("Play command to {} failed: {}", addr, e);
            e
        })
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Waits until the session reaches `state`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        // ---
        let mut rx = self.shared.state.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await;
        matches!(result, Ok(Ok(_)))
    }

    pub fn resources(&self) -> SessionResources {
        // ---
        SessionResources {
            clock_open: self.shared.clock_open.load(Ordering::Acquire),
            transport_open: self.shared.transport_open.load(Ordering::Acquire),
            sleep_lease_held: self.shared.lease_held.load(Ordering::Acquire),
        }
    }

    /// Error that ended the last start or stream, if any.
    pub fn last_error(&self) -> Option<SessionError> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Audio packets sent by the current (or last) stream.
    pub fn packets_sent(&self) -> u64 {
        self.shared.packets_sent.load(Ordering::Acquire)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl GainControl for StreamingSession {
    fn set_gain_db(&self, db: f32) {
        self.update_replay_gain(db);
    }

    fn gain_db(&self) -> f32 {
        self.shared.gain_db()
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        // ---
        if let Some(token) = self.lock_pending().take() {
            token.cancel();
        }
        // The loop tears down and releases its resources on its own
        if let Some(stream) = self.active.get_mut().take() {
            stream.stop.cancel();
        }
    }
}

fn sanitize_gain(db: f32) -> f32 {
    // ---
    if db.is_finite() {
        db
    } else {
        warn!("Ignoring non-finite gain {}, using 0 dB", db);
        0.0
    }
}

/// Everything a running stream owns.
struct SendLoop {
    // ---
    rtsp: RtspClient,
    transport: AudioTransport,
    clock: PacingClock,
    _lease: SleepLease,
    source: PcmSource,
    shared: Arc<Shared>,
    stop: CancellationToken,
    start: StreamStart,
    latency_frames: u32,
    teardown_timeout: Duration,
    metrics: Option<MetricsContext>,
}

impl SendLoop {
    // ---
    async fn run(mut self) {
        // ---
        let outcome = self.pump().await;

        match tokio::time::timeout(self.teardown_timeout, handshake::teardown(&mut self.rtsp)).await
        {
            Ok(Ok(())) => debug!("TEARDOWN acknowledged"),
            Ok(Err(e)) => debug!("TEARDOWN failed: {}", e),
            Err(_) => debug!("TEARDOWN not answered within {:?}", self.teardown_timeout),
        }

        let (packets, bytes) = self.transport.stats();
        match &outcome {
            Ok(()) => info!("Stream ended: {} packets, {} bytes", packets, bytes),
            Err(e) => {
                error!("Stream interrupted after {} packets: {}", packets, e);
                self.shared.record_error(e);
                if let Some(m) = &self.metrics {
                    m.stream_interruptions_total.inc();
                }
            }
        }
        if let Some(m) = &self.metrics {
            m.active_sessions.dec();
        }
        if let Err(e) = self.shared.finish_capture() {
            warn!("{}", e);
        }

        // Release clock, lock, sockets and lease before anyone sees Idle
        let shared = self.shared.clone();
        drop(self);
        shared.set_state(SessionState::Idle);
    }

    /// Sends packets on schedule until the source runs out or `stop` fires.
    async fn pump(&mut self) -> Result<()> {
        // ---
        let packet_duration = PacingClock::packet_duration();
        let mut sequence = self.start.sequence;
        let mut rtptime = self.start.rtptime;
        let mut index: u64 = 0;

        self.clock.reset();

        loop {
            let deadline = self.clock.deadline(index);
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!("Stop requested at packet {}", index);
                    return Ok(());
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let drift = self.clock.drift(index, Instant::now());
            if let Some(m) = &self.metrics {
                m.pacing_drift_seconds.observe(drift.as_secs_f64());
            }
            if drift > packet_duration {
                warn!("Packet {} is {:?} late", index, drift);
            }

            if index % SYNC_INTERVAL == 0 {
                let sync = SyncPacket::new(rtptime, self.latency_frames, index == 0);
                self.transport
                    .send_sync(&sync)
                    .await
                    .map_err(|e| SessionError::StreamInterrupted(format!("sync: {}", e)))?;
            }

            let Some(frames) = self.source.read_frames(FRAMES_PER_PACKET) else {
                info!("End of track after {} packets", index);
                return Ok(());
            };

            let mut pcm = frames.to_vec();
            scale_samples(&mut pcm, db_to_linear(self.shared.gain_db()));
            self.shared.capture_samples(&pcm);
            let frame_count = pcm.len() / RAOP_CHANNELS as usize;

            let payload = alac::encode_uncompressed(&pcm, RAOP_CHANNELS as usize);
            let packet = RtpPacket::new(sequence, rtptime, self.start.ssrc, payload)
                .with_marker(index == 0);

            self.transport
                .send_audio(&packet)
                .await
                .map_err(|e| SessionError::StreamInterrupted(format!("audio: {}", e)))?;

            self.shared.packets_sent.fetch_add(1, Ordering::AcqRel);
            sequence = sequence.wrapping_add(1);
            rtptime = rtptime.wrapping_add(frame_count as u32);
            index += 1;
        }
    }
}
