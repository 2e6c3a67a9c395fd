//! DACP/DMAP transport commands over HTTP.

use hyper::{Body, Client, Method, Request, StatusCode};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SessionError};

/// Path of the "play" transport command.
pub const PLAY_PATH: &str = "/ctrl-int/1/play?session-id=1";

/// Sends a DACP transport command and waits for the answer.
///
/// Any 2xx status is success (receivers usually answer 204).
pub async fn send_command(
    addr: SocketAddr,
    path: &str,
    active_remote: &str,
    timeout: Duration,
) -> Result<StatusCode> {
    // ---
    let uri = format!("http://{}{}", addr, path);
    let request = Request::builder()
        .method(Method::GET)
        .uri(&uri)
        .header("Accept", "*/*")
        .header("Client-DAAP-Version", "3.13")
        .header("Viewer-Only-Client", "1")
        .header("Active-Remote", active_remote)
        .body(Body::empty())
        .map_err(|e| SessionError::ConnectionFailed(format!("bad request {}: {}", uri, e)))?;

    debug!("DACP GET {}", uri);

    let client = Client::new();
    let response = match tokio::time::timeout(timeout, client.request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            return Err(SessionError::ConnectionFailed(format!("{}: {}", addr, e)));
        }
        Err(_) => {
            return Err(SessionError::Timeout(format!(
                "no DACP answer from {} within {:?}",
                addr, timeout
            )));
        }
    };

    let status = response.status();
    if !status.is_success() {
        return Err(SessionError::ReceiverRejected(format!(
            "DACP {} answered {}",
            path, status
        )));
    }

    info!("DACP {} -> {}", path, status);
    Ok(status)
}
