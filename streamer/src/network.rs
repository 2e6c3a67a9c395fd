//! UDP transport for the audio, control and timing channels.
//!
//! The control and timing sockets are bound before SETUP because their
//! ports go into the `Transport` request header. Once the receiver answers,
//! [`AudioTransport::connect`] adds the audio socket and starts answering
//! timing requests.

use raop_common::rtp::PAYLOAD_TYPE_TIMING_REQUEST;
use raop_common::{MetricsContext, RtpPacket, SyncPacket, TimingPacket};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::rtsp::TransportPorts;

/// Local control and timing sockets, bound ahead of SETUP.
pub struct LocalChannels {
    // ---
    control: UdpSocket,
    timing: UdpSocket,
}

impl LocalChannels {
    // ---
    /// Binds both sockets on an ephemeral port of the same family as
    /// `peer`.
    pub async fn bind(peer: IpAddr) -> io::Result<Self> {
        // ---
        let any: IpAddr = match peer {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let control = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
        let timing = UdpSocket::bind(SocketAddr::new(any, 0)).await?;

        debug!(
            "Control channel on {}, timing channel on {}",
            control.local_addr()?,
            timing.local_addr()?
        );
        Ok(Self { control, timing })
    }

    pub fn control_port(&self) -> io::Result<u16> {
        Ok(self.control.local_addr()?.port())
    }

    pub fn timing_port(&self) -> io::Result<u16> {
        Ok(self.timing.local_addr()?.port())
    }
}

/// Open UDP channels to one receiver.
///
/// Send errors are returned to the caller; the send loop decides whether a
/// failure ends the stream. Dropping the transport stops the timing
/// responder and closes every socket.
pub struct AudioTransport {
    // ---
    audio: UdpSocket,
    control: UdpSocket,
    audio_addr: SocketAddr,
    control_addr: Option<SocketAddr>,
    timing_task: JoinHandle<()>,
    packets_sent: u64,
    bytes_sent: u64,
    open: Arc<AtomicBool>,
    metrics: Option<MetricsContext>,
}

impl AudioTransport {
    // ---
    /// Opens the audio socket toward the receiver's `server_port` and
    /// starts the timing responder.
    ///
    /// `open` is set for as long as the transport exists.
    pub async fn connect(
        channels: LocalChannels,
        peer: IpAddr,
        server_port: u16,
        ports: TransportPorts,
        open: Arc<AtomicBool>,
        metrics: Option<MetricsContext>,
    ) -> io::Result<Self> {
        // ---
        let local = channels.control.local_addr()?;
        let audio = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;
        let audio_addr = SocketAddr::new(peer, server_port);
        let control_addr = ports.control_port.map(|p| SocketAddr::new(peer, p));

        debug!(
            "Audio {} -> {}, control -> {:?}, timing port {:?}",
            audio.local_addr()?,
            audio_addr,
            control_addr,
            ports.timing_port
        );

        let timing_task = tokio::spawn(respond_to_timing(channels.timing, metrics.clone()));
        open.store(true, Ordering::Release);

        Ok(Self {
            audio,
            control: channels.control,
            audio_addr,
            control_addr,
            timing_task,
            packets_sent: 0,
            bytes_sent: 0,
            open,
            metrics,
        })
    }

    /// Sends one audio packet.
    pub async fn send_audio(&mut self, packet: &RtpPacket) -> io::Result<usize> {
        // ---
        let data = packet.serialize();
        let bytes = self.audio.send_to(&data, self.audio_addr).await?;

        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
        if let Some(m) = &self.metrics {
            m.packets_sent_total.inc();
            m.bytes_sent_total.inc_by(bytes as u64);
        }

        if self.packets_sent % 500 == 0 {
            debug!(
                "Sent {} packets ({} bytes) - seq={}",
                self.packets_sent, self.bytes_sent, packet.sequence
            );
        }
        Ok(bytes)
    }

    /// Sends a sync packet on the control channel. A receiver that did not
    /// announce a control port gets none.
    pub async fn send_sync(&mut self, sync: &SyncPacket) -> io::Result<()> {
        // ---
        let Some(addr) = self.control_addr else {
            return Ok(());
        };

        self.control.send_to(&sync.serialize(), addr).await?;
        trace!("Sync sent: next rtptime {}", sync.next_rtptime);
        if let Some(m) = &self.metrics {
            m.sync_packets_sent_total.inc();
        }
        Ok(())
    }

    /// Returns (packets, bytes) sent on the audio channel.
    pub fn stats(&self) -> (u64, u64) {
        (self.packets_sent, self.bytes_sent)
    }
}

impl Drop for AudioTransport {
    fn drop(&mut self) {
        // ---
        self.timing_task.abort();
        self.open.store(false, Ordering::Release);
        debug!(
            "Transport to {} closed after {} packets",
            self.audio_addr, self.packets_sent
        );
    }
}

/// Answers every timing request on `socket` until aborted.
async fn respond_to_timing(socket: UdpSocket, metrics: Option<MetricsContext>) {
    // ---
    let mut buf = [0u8; 128];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                // ICMP errors from earlier replies surface here; keep going
                trace!("Timing socket receive error: {}", e);
                continue;
            }
        };

        let request = match TimingPacket::deserialize(&buf[..len]) {
            Ok(p) if p.payload_type == PAYLOAD_TYPE_TIMING_REQUEST => p,
            Ok(p) => {
                trace!("Ignoring timing packet type 0x{:02x}", p.payload_type);
                continue;
            }
            Err(e) => {
                debug!("Malformed timing packet from {}: {}", from, e);
                continue;
            }
        };

        match socket.send_to(&request.reply().serialize(), from).await {
            Ok(_) => {
                if let Some(m) = &metrics {
                    m.timing_replies_total.inc();
                }
            }
            Err(e) => warn!("Failed to answer timing request from {}: {}", from, e),
        }
    }
}
