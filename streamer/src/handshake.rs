//! RTSP negotiation: OPTIONS, ANNOUNCE, SETUP, RECORD.

use raop_common::alac::FRAMES_PER_PACKET;
use raop_common::pcm::{RAOP_CHANNELS, RAOP_SAMPLE_RATE};
use raop_common::MetricsContext;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, SessionError};
use crate::network::{AudioTransport, LocalChannels};
use crate::rtsp::{ClientIds, RtspClient, RtspResponse, TransportPorts};

/// Latency assumed when RECORD does not report `Audio-Latency`.
pub const DEFAULT_LATENCY_FRAMES: u32 = 11_025;

/// Where the audio stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStart {
    // ---
    pub sequence: u16,
    pub rtptime: u32,
    pub ssrc: u32,
}

impl StreamStart {
    // ---
    pub fn random() -> Self {
        // ---
        Self {
            sequence: rand::random(),
            rtptime: rand::random(),
            ssrc: rand::random(),
        }
    }
}

/// A receiver that accepted RECORD and is waiting for audio.
pub struct Negotiated {
    // ---
    pub rtsp: RtspClient,
    pub transport: AudioTransport,
    pub latency_frames: u32,
}

/// SDP for 16-bit stereo ALAC at 44.1 kHz, 352 frames per packet.
pub fn announce_sdp(session_id: u32, local: IpAddr, remote: IpAddr) -> String {
    // ---
    let family = |ip: IpAddr| if ip.is_ipv4() { "IP4" } else { "IP6" };
    format!(
        "v=0\r\n\
         o=iTunes {session_id} 0 IN {} {local}\r\n\
         s=iTunes\r\n\
         c=IN {} {remote}\r\n\
         t=0 0\r\n\
         m=audio 0 RTP/AVP 96\r\n\
         a=rtpmap:96 AppleLossless\r\n\
         a=fmtp:96 {FRAMES_PER_PACKET} 0 16 40 10 14 {RAOP_CHANNELS} 255 0 0 {RAOP_SAMPLE_RATE}\r\n",
        family(local),
        family(remote),
    )
}

/// Runs the full handshake against `target`.
///
/// Not bounded in time and not cancellable by itself; the caller races it
/// against its timeout and cancellation tokens. Dropping the future closes
/// whatever was opened so far.
pub async fn negotiate(
    target: SocketAddr,
    ids: ClientIds,
    start: StreamStart,
    transport_open: Arc<AtomicBool>,
    metrics: Option<MetricsContext>,
) -> Result<Negotiated> {
    // ---
    let mut rtsp = RtspClient::connect(target, ids).await?;
    let local_ip = rtsp.local_addr().ip();

    let options = rtsp.request_to("OPTIONS", "*", &[], None).await?;
    expect_success("OPTIONS", &options)?;
    if let Some(public) = options.header("Public") {
        debug!("Receiver supports: {}", public);
    }

    let sdp = announce_sdp(rtsp.ids().session_id, local_ip, target.ip());
    let announce = rtsp
        .request("ANNOUNCE", &[], Some(("application/sdp", sdp.as_bytes())))
        .await?;
    expect_success("ANNOUNCE", &announce)?;

    let channels = LocalChannels::bind(target.ip())
        .await
        .map_err(|e| SessionError::ConnectionFailed(format!("UDP bind: {}", e)))?;
    let local_port = |r: std::io::Result<u16>| {
        r.map_err(|e| SessionError::ConnectionFailed(format!("UDP socket: {}", e)))
    };
    let transport_header = format!(
        "RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;control_port={};timing_port={}",
        local_port(channels.control_port())?,
        local_port(channels.timing_port())?
    );

    let setup = rtsp
        .request("SETUP", &[("Transport", transport_header)], None)
        .await?;
    expect_success("SETUP", &setup)?;

    let session = setup
        .header("Session")
        .ok_or_else(|| SessionError::ReceiverRejected("SETUP response without Session".into()))?
        .to_string();
    rtsp.set_session(&session);

    let ports = setup
        .header("Transport")
        .map(TransportPorts::parse)
        .unwrap_or_default();
    let server_port = ports.server_port.ok_or_else(|| {
        SessionError::ReceiverRejected("SETUP response without server_port".into())
    })?;

    let record = rtsp
        .request(
            "RECORD",
            &[
                ("Range", "npt=0-".to_string()),
                (
                    "RTP-Info",
                    format!("seq={};rtptime={}", start.sequence, start.rtptime),
                ),
            ],
            None,
        )
        .await?;
    expect_success("RECORD", &record)?;

    let latency_frames = record
        .header("Audio-Latency")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_LATENCY_FRAMES);

    let transport = AudioTransport::connect(
        channels,
        target.ip(),
        server_port,
        ports,
        transport_open,
        metrics,
    )
    .await
    .map_err(|e| SessionError::ConnectionFailed(format!("audio socket: {}", e)))?;

    info!(
        "Negotiated with {}: session {}, audio port {}, latency {} frames",
        target,
        rtsp.session().unwrap_or("-"),
        server_port,
        latency_frames
    );

    Ok(Negotiated {
        rtsp,
        transport,
        latency_frames,
    })
}

/// Best-effort TEARDOWN; the caller bounds it in time.
pub async fn teardown(rtsp: &mut RtspClient) -> Result<()> {
    // ---
    let response = rtsp.request("TEARDOWN", &[], None).await?;
    expect_success("TEARDOWN", &response)
}

fn expect_success(method: &str, response: &RtspResponse) -> Result<()> {
    // ---
    if response.is_success() {
        return Ok(());
    }
    Err(SessionError::ReceiverRejected(format!(
        "{} answered {} {}",
        method, response.status, response.reason
    )))
}
