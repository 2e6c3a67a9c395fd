//! Minimal RTSP/1.0 client for the RAOP control connection.

use std::fmt::Write as _;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{Result, SessionError};

pub const USER_AGENT: &str = concat!("raop-streamer/", env!("CARGO_PKG_VERSION"));

/// Longest body we are willing to read from a response.
const MAX_BODY: usize = 64 * 1024;

/// Identifiers sent with every request so the receiver can find our DACP
/// service and tell sessions apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIds {
    // ---
    /// 64-bit hex, doubles as DACP-ID
    pub client_instance: String,
    pub active_remote: String,
    /// Numeric id used in the request URL
    pub session_id: u32,
}

impl ClientIds {
    // ---
    pub fn random() -> Self {
        // ---
        Self {
            client_instance: format!("{:016X}", rand::random::<u64>()),
            active_remote: rand::random::<u32>().to_string(),
            session_id: rand::random::<u32>(),
        }
    }
}

/// A parsed RTSP response.
#[derive(Debug, Clone)]
pub struct RtspResponse {
    // ---
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    // ---
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        // ---
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Ports announced in a SETUP response `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportPorts {
    // ---
    pub server_port: Option<u16>,
    pub control_port: Option<u16>,
    pub timing_port: Option<u16>,
}

impl TransportPorts {
    // ---
    /// Parses `RTP/AVP/UDP;unicast;server_port=6000;control_port=6001;...`.
    pub fn parse(value: &str) -> Self {
        // ---
        let mut ports = Self::default();
        for param in value.split(';') {
            let Some((key, val)) = param.trim().split_once('=') else {
                continue;
            };
            let port = val.trim().parse::<u16>().ok();
            match key.trim() {
                "server_port" => ports.server_port = port,
                "control_port" => ports.control_port = port,
                "timing_port" => ports.timing_port = port,
                _ => {}
            }
        }
        ports
    }
}

/// RTSP connection to one receiver.
///
/// Requests are strictly sequential; `CSeq` starts at 1 and increases by
/// one per request.
pub struct RtspClient {
    // ---
    stream: BufReader<TcpStream>,
    url: String,
    cseq: u32,
    session: Option<String>,
    ids: ClientIds,
    local: SocketAddr,
}

impl RtspClient {
    // ---
    pub async fn connect(addr: SocketAddr, ids: ClientIds) -> Result<Self> {
        // ---
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();

        let local = stream
            .local_addr()
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;
        let url = format!("rtsp://{}/{}", local.ip(), ids.session_id);
        debug!("RTSP connected {} -> {}", local, addr);

        Ok(Self {
            stream: BufReader::new(stream),
            url,
            cseq: 0,
            session: None,
            ids,
            local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn ids(&self) -> &ClientIds {
        &self.ids
    }

    /// Sequence number of the last request sent.
    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Adopts the id from a SETUP response (`Session: <id>[;timeout=..]`).
    pub fn set_session(&mut self, value: &str) {
        // ---
        let id = value.split(';').next().unwrap_or(value).trim();
        self.session = Some(id.to_string());
    }

    /// Sends a request on the session URL.
    pub async fn request(
        &mut self,
        method: &str,
        headers: &[(&str, String)],
        body: Option<(&str, &[u8])>,
    ) -> Result<RtspResponse> {
        // ---
        let url = self.url.clone();
        self.request_to(method, &url, headers, body).await
    }

    /// Sends a request to an explicit URI (`*` for OPTIONS).
    pub async fn request_to(
        &mut self,
        method: &str,
        uri: &str,
        headers: &[(&str, String)],
        body: Option<(&str, &[u8])>,
    ) -> Result<RtspResponse> {
        // ---
        self.cseq += 1;

        let mut head = String::new();
        let _ = write!(head, "{} {} RTSP/1.0\r\n", method, uri);
        let _ = write!(head, "CSeq: {}\r\n", self.cseq);
        let _ = write!(head, "User-Agent: {}\r\n", USER_AGENT);
        let _ = write!(head, "Client-Instance: {}\r\n", self.ids.client_instance);
        let _ = write!(head, "DACP-ID: {}\r\n", self.ids.client_instance);
        let _ = write!(head, "Active-Remote: {}\r\n", self.ids.active_remote);
        if let Some(session) = &self.session {
            let _ = write!(head, "Session: {}\r\n", session);
        }
        for (name, value) in headers {
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        if let Some((content_type, data)) = body {
            let _ = write!(head, "Content-Type: {}\r\n", content_type);
            let _ = write!(head, "Content-Length: {}\r\n", data.len());
        }
        head.push_str("\r\n");

        trace!("RTSP >>\n{}", head);

        let io_err = |e: std::io::Error| SessionError::ConnectionFailed(format!("{}: {}", method, e));
        let socket = self.stream.get_mut();
        socket.write_all(head.as_bytes()).await.map_err(io_err)?;
        if let Some((_, data)) = body {
            socket.write_all(data).await.map_err(io_err)?;
        }
        socket.flush().await.map_err(io_err)?;

        let response = self.read_response(method).await?;
        debug!(
            "RTSP {} (CSeq {}) -> {} {}",
            method, self.cseq, response.status, response.reason
        );
        Ok(response)
    }

    async fn read_response(&mut self, method: &str) -> Result<RtspResponse> {
        // ---
        let closed = || {
            SessionError::ConnectionFailed(format!("receiver closed the connection during {}", method))
        };
        let io_err = |e: std::io::Error| SessionError::ConnectionFailed(format!("{}: {}", method, e));

        let mut line = String::new();
        if self.stream.read_line(&mut line).await.map_err(io_err)? == 0 {
            return Err(closed());
        }
        let (status, reason) = parse_status_line(&line)?;

        let mut headers = Vec::new();
        loop {
            line.clear();
            if self.stream.read_line(&mut line).await.map_err(io_err)? == 0 {
                return Err(closed());
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some((name, value)) = trimmed.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let mut response = RtspResponse {
            status,
            reason,
            headers,
            body: Vec::new(),
        };

        let length = response
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        if length > MAX_BODY {
            return Err(SessionError::ReceiverRejected(format!(
                "{} response body of {} bytes",
                method, length
            )));
        }
        if length > 0 {
            let mut body = vec![0u8; length];
            self.stream.read_exact(&mut body).await.map_err(io_err)?;
            response.body = body;
        }

        Ok(response)
    }
}

/// `RTSP/1.0 200 OK` → (200, "OK")
fn parse_status_line(line: &str) -> Result<(u16, String)> {
    // ---
    let malformed = || SessionError::ReceiverRejected(format!("malformed status line {:?}", line.trim_end()));

    let mut parts = line.trim_end().splitn(3, ' ');
    let version = parts.next().ok_or_else(malformed)?;
    if !version.starts_with("RTSP/") {
        return Err(malformed());
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(malformed)?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((status, reason))
}
