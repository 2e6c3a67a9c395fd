//! Loopback fake RAOP receiver for session tests.
//!
//! Speaks just enough RTSP to get through OPTIONS/ANNOUNCE/SETUP/RECORD,
//! records every audio packet with its arrival time, and runs a DACP
//! endpoint that answers 204.

#![allow(dead_code)]

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use raop_common::RtpPacket;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use streamer::SessionConfig;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

/// How the fake answers RTSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Accepts everything
    Normal,
    /// Accepts the connection, never answers
    Silent,
    /// Answers every request with this status
    Reject(u16),
    /// Accepts everything but advertises audio port 0, so every audio
    /// packet the session sends fails
    DeadAudioPort,
}

/// An audio packet as it arrived.
#[derive(Debug, Clone)]
pub struct Received {
    pub at: Instant,
    pub packet: RtpPacket,
}

#[derive(Default)]
struct Log {
    methods: Mutex<Vec<String>>,
    audio: Mutex<Vec<Received>>,
    sync_packets: AtomicUsize,
    dacp_hits: AtomicUsize,
}

/// Fake receiver bound to 127.0.0.1 on ephemeral ports.
pub struct FakeReceiver {
    // ---
    pub rtsp_addr: SocketAddr,
    pub dacp_addr: SocketAddr,
    log: Arc<Log>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeReceiver {
    // ---
    pub async fn start(mode: Mode) -> Self {
        // ---
        let log = Arc::new(Log::default());
        let mut tasks = Vec::new();

        let audio = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let timing = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ports = (
            audio.local_addr().unwrap().port(),
            control.local_addr().unwrap().port(),
            timing.local_addr().unwrap().port(),
        );

        tasks.push(tokio::spawn(collect_audio(audio, log.clone())));
        tasks.push(tokio::spawn(count_sync(control, log.clone())));
        // Timing socket only needs to exist
        tasks.push(tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while timing.recv_from(&mut buf).await.is_ok() {}
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rtsp_addr = listener.local_addr().unwrap();
        let rtsp_log = log.clone();
        tasks.push(tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_rtsp(socket, mode, ports, rtsp_log.clone()));
            }
        }));

        let dacp_log = log.clone();
        let make = make_service_fn(move |_| {
            let log = dacp_log.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let log = log.clone();
                    async move {
                        let status = if req.uri().path() == "/ctrl-int/1/play" {
                            log.dacp_hits.fetch_add(1, Ordering::SeqCst);
                            StatusCode::NO_CONTENT
                        } else {
                            StatusCode::NOT_FOUND
                        };
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Body::empty())
                                .unwrap(),
                        )
                    }
                }))
            }
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
        let dacp_addr = server.local_addr();
        tasks.push(tokio::spawn(async move {
            let _ = server.await;
        }));

        Self {
            rtsp_addr,
            dacp_addr,
            log,
            tasks,
        }
    }

    /// Session settings pointing at this fake, with the lock under `dir`.
    pub fn config(&self, dir: &Path) -> SessionConfig {
        // ---
        SessionConfig {
            negotiation_timeout_ms: 2_000,
            teardown_timeout_ms: 500,
            command_timeout_ms: 1_000,
            lead_ms: 0,
            dacp_port: self.dacp_addr.port(),
            lock_path: Some(dir.join("raop-streamer.lock")),
            inhibit_sleep: false,
            sleep_command: None,
            capture_dir: None,
        }
    }

    pub fn methods(&self) -> Vec<String> {
        self.log.methods.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| *m == method).count()
    }

    pub fn audio(&self) -> Vec<Received> {
        self.log.audio.lock().unwrap().clone()
    }

    pub fn sync_packets(&self) -> usize {
        self.log.sync_packets.load(Ordering::SeqCst)
    }

    pub fn dacp_hits(&self) -> usize {
        self.log.dacp_hits.load(Ordering::SeqCst)
    }
}

impl Drop for FakeReceiver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn collect_audio(socket: UdpSocket, log: Arc<Log>) {
    // ---
    let mut buf = vec![0u8; 4096];
    while let Ok(len) = socket.recv(&mut buf).await {
        let at = Instant::now();
        if let Ok(packet) = RtpPacket::deserialize(&buf[..len]) {
            log.audio.lock().unwrap().push(Received { at, packet });
        }
    }
}

async fn count_sync(socket: UdpSocket, log: Arc<Log>) {
    // ---
    let mut buf = [0u8; 64];
    while socket.recv(&mut buf).await.is_ok() {
        log.sync_packets.fetch_add(1, Ordering::SeqCst);
    }
}

async fn serve_rtsp(socket: TcpStream, mode: Mode, ports: (u16, u16, u16), log: Arc<Log>) {
    // ---
    let mut reader = BufReader::new(socket);

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let method = line.split_whitespace().next().unwrap_or("").to_string();

        let mut cseq = String::from("0");
        let mut length = 0usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                match name.trim().to_ascii_lowercase().as_str() {
                    "cseq" => cseq = value.trim().to_string(),
                    "content-length" => length = value.trim().parse().unwrap_or(0),
                    _ => {}
                }
            }
        }
        if length > 0 {
            let mut body = vec![0u8; length];
            if reader.read_exact(&mut body).await.is_err() {
                return;
            }
        }

        log.methods.lock().unwrap().push(method.clone());

        let response = match mode {
            Mode::Silent => continue,
            Mode::Reject(status) => {
                format!("RTSP/1.0 {} Rejected\r\nCSeq: {}\r\n\r\n", status, cseq)
            }
            Mode::Normal | Mode::DeadAudioPort => {
                let audio_port = if mode == Mode::DeadAudioPort { 0 } else { ports.0 };
                let extra = match method.as_str() {
                    "OPTIONS" => "Public: ANNOUNCE, SETUP, RECORD, TEARDOWN\r\n".to_string(),
                    "SETUP" => format!(
                        "Session: 1;timeout=60\r\nTransport: RTP/AVP/UDP;unicast;mode=record;\
                         server_port={};control_port={};timing_port={}\r\n",
                        audio_port, ports.1, ports.2
                    ),
                    "RECORD" => "Audio-Latency: 11025\r\n".to_string(),
                    _ => String::new(),
                };
                format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n{}\r\n", cseq, extra)
            }
        };

        if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}
