//! Interactive attach/exec sessions.
//!
//! An upgraded client connection is bridged onto a raw stream with the
//! backend. The session is an explicit state machine so cancellation and
//! error paths stay enumerable and testable with injected dialers:
//! Received -> Authorized -> Dispatch -> Upgraded -> Bridging -> Closed.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Session phases, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HijackPhase {
    Received,
    Authorized,
    Dispatch,
    Upgraded,
    Bridging,
    Closed,
}

impl HijackPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HijackPhase::Received => "received",
            HijackPhase::Authorized => "authorized",
            HijackPhase::Dispatch => "dispatch",
            HijackPhase::Upgraded => "upgraded",
            HijackPhase::Bridging => "bridging",
            HijackPhase::Closed => "closed",
        }
    }
}

/// The two interactive operations a session can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HijackOp {
    Attach,
    ExecStart,
}

impl HijackOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            HijackOp::Attach => "attach",
            HijackOp::ExecStart => "exec",
        }
    }
}

#[derive(Debug, Error)]
pub enum HijackError {
    #[error("operation id must be hexadecimal")]
    InvalidOperationId,
    #[error("failed to dial backend: {0}")]
    Dial(#[source] anyhow::Error),
    #[error("backend refused the upgrade: {0}")]
    UpgradeRefused(String),
    #[error("bridging failed: {0}")]
    Bridge(#[source] std::io::Error),
}

/// Operation IDs come from the client and are spliced into a raw request
/// line; anything non-hexadecimal is rejected before any backend dial.
pub fn validate_operation_id(id: &str) -> Result<(), HijackError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HijackError::InvalidOperationId);
    }
    Ok(())
}

/// The synthetic backend-side request that flips the connection into a raw
/// stream.
pub fn synthetic_request(op: HijackOp, id: &str) -> String {
    match op {
        HijackOp::Attach => format!(
            "POST /containers/{id}/attach?stdin=1&stdout=1&stderr=1&stream=1 HTTP/1.1\r\n\
             Host: unixsocket\r\n\
             Connection: Upgrade\r\n\
             Upgrade: tcp\r\n\
             Content-Length: 0\r\n\
             \r\n"
        ),
        HijackOp::ExecStart => {
            // Tty on, Detach off unless the caller overrides; interactive
            // sessions are the whole point of the hijack.
            let body = r#"{"Tty":true,"Detach":false}"#;
            format!(
                "POST /exec/{id}/start HTTP/1.1\r\n\
                 Host: unixsocket\r\n\
                 Connection: Upgrade\r\n\
                 Upgrade: tcp\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 \r\n\
                 {body}",
                body.len()
            )
        }
    }
}

/// A raw bidirectional byte stream with the backend.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// Dials the backend for the session's data plane. Injected so the state
/// machine is testable without real sockets.
#[async_trait]
pub trait BackendDialer: Send + Sync {
    async fn dial(&self) -> anyhow::Result<Box<dyn RawStream>>;
}

/// Dials a TCP backend with keep-alive enabled: attach sessions can sit
/// idle for long stretches and would otherwise be dropped by intermediate
/// network equipment.
pub struct TcpDialer {
    address: String,
    keepalive: Duration,
}

impl TcpDialer {
    pub fn new(address: impl Into<String>, keepalive: Duration) -> Self {
        Self {
            address: address.into(),
            keepalive,
        }
    }
}

#[async_trait]
impl BackendDialer for TcpDialer {
    async fn dial(&self) -> anyhow::Result<Box<dyn RawStream>> {
        let stream = TcpStream::connect(&self.address).await?;
        let sock = socket2::SockRef::from(&stream);
        sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(self.keepalive))?;
        Ok(Box::new(stream))
    }
}

/// Dials a Unix-socket backend.
pub struct UnixDialer {
    path: PathBuf,
}

impl UnixDialer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl BackendDialer for UnixDialer {
    async fn dial(&self) -> anyhow::Result<Box<dyn RawStream>> {
        #[cfg(unix)]
        {
            let stream = tokio::net::UnixStream::connect(&self.path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!(
                "local-socket endpoints are not supported on this platform: {}",
                self.path.display()
            )
        }
    }
}

/// Upgrade response from the backend: its status line plus any stream bytes
/// that arrived in the same read as the header block.
#[derive(Debug)]
pub(crate) struct UpgradeResponse {
    pub status: u16,
    pub leftover: Bytes,
}

/// Read the backend's HTTP response headers off the raw stream without
/// swallowing stream bytes that follow them.
pub(crate) async fn read_upgrade_response<S>(stream: &mut S) -> Result<UpgradeResponse, HijackError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_header_end(&buf) {
            let head = &buf[..end];
            let status = parse_status_line(head)?;
            let leftover = Bytes::copy_from_slice(&buf[end..]);
            return Ok(UpgradeResponse { status, leftover });
        }
        if buf.len() > 16 * 1024 {
            return Err(HijackError::UpgradeRefused(
                "response header block too large".to_string(),
            ));
        }
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(HijackError::Bridge)?;
        if n == 0 {
            return Err(HijackError::UpgradeRefused(
                "backend closed during upgrade".to_string(),
            ));
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_status_line(head: &[u8]) -> Result<u16, HijackError> {
    let line = head.split(|&b| b == b'\r').next().unwrap_or_default();
    let text = std::str::from_utf8(line)
        .map_err(|_| HijackError::UpgradeRefused("non-UTF8 status line".to_string()))?;
    let mut parts = text.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(HijackError::UpgradeRefused(format!(
            "unexpected status line: {text}"
        )));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| HijackError::UpgradeRefused(format!("unexpected status line: {text}")))
}

/// Run the Dispatch and Upgraded phases: dial the backend, send the
/// synthetic request, and verify the upgrade. Returns the raw stream plus
/// any stream bytes that arrived alongside the upgrade headers.
pub async fn open_backend(
    dialer: &dyn BackendDialer,
    op: HijackOp,
    operation_id: &str,
) -> Result<(Box<dyn RawStream>, Bytes), HijackError> {
    validate_operation_id(operation_id)?;

    let mut backend = dialer.dial().await.map_err(HijackError::Dial)?;
    debug!(phase = HijackPhase::Dispatch.as_str(), %operation_id, "backend dialed");

    backend
        .write_all(synthetic_request(op, operation_id).as_bytes())
        .await
        .map_err(HijackError::Bridge)?;

    let upgrade = read_upgrade_response(&mut backend).await?;
    // 101 is the switching-protocols answer; Docker also streams attach
    // output on a 200 with a connection that never closes.
    if upgrade.status != 101 && upgrade.status != 200 {
        return Err(HijackError::UpgradeRefused(format!(
            "status {}",
            upgrade.status
        )));
    }
    debug!(phase = HijackPhase::Upgraded.as_str(), %operation_id, "backend upgraded");

    Ok((backend, upgrade.leftover))
}

/// Run a full session against an already-authorized operation: open the
/// backend, then copy bytes in both directions until either side closes. A
/// dropped connection ends the session; there is no reconnect.
pub async fn run_session<C>(
    dialer: &dyn BackendDialer,
    op: HijackOp,
    operation_id: &str,
    client: &mut C,
) -> Result<(), HijackError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut backend, leftover) = open_backend(dialer, op, operation_id).await?;

    if !leftover.is_empty() {
        client.write_all(&leftover).await.map_err(HijackError::Bridge)?;
    }

    debug!(phase = HijackPhase::Bridging.as_str(), %operation_id, "session bridged");
    tokio::io::copy_bidirectional(client, &mut backend)
        .await
        .map_err(HijackError::Bridge)?;
    debug!(phase = HijackPhase::Closed.as_str(), %operation_id, "session closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn operation_ids_must_be_hex() {
        assert!(validate_operation_id("abcdef0123456789").is_ok());
        assert!(validate_operation_id("ABCDEF").is_ok());
        assert!(validate_operation_id("").is_err());
        assert!(validate_operation_id("not-hex").is_err());
        assert!(validate_operation_id("abc/../../etc").is_err());
    }

    #[test]
    fn attach_request_carries_the_upgrade_headers() {
        let req = synthetic_request(HijackOp::Attach, "deadbeef");
        assert!(req.starts_with(
            "POST /containers/deadbeef/attach?stdin=1&stdout=1&stderr=1&stream=1 HTTP/1.1\r\n"
        ));
        assert!(req.contains("Connection: Upgrade\r\n"));
        assert!(req.contains("Upgrade: tcp\r\n"));
    }

    #[test]
    fn exec_start_defaults_to_tty_without_detach() {
        let req = synthetic_request(HijackOp::ExecStart, "cafe01");
        assert!(req.starts_with("POST /exec/cafe01/start HTTP/1.1\r\n"));
        assert!(req.ends_with(r#"{"Tty":true,"Detach":false}"#));
        assert!(req.contains("Content-Length: 27\r\n"));
    }

    #[tokio::test]
    async fn upgrade_response_preserves_leftover_stream_bytes() {
        let (mut near, mut far) = duplex(1024);
        far.write_all(b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\n\r\nearly-bytes")
            .await
            .unwrap();

        let upgrade = read_upgrade_response(&mut near).await.unwrap();
        assert_eq!(upgrade.status, 101);
        assert_eq!(&upgrade.leftover[..], b"early-bytes");
    }

    #[tokio::test]
    async fn upgrade_rejects_non_http_preamble() {
        let (mut near, mut far) = duplex(1024);
        far.write_all(b"garbage preamble\r\n\r\n").await.unwrap();
        let err = read_upgrade_response(&mut near).await.unwrap_err();
        assert!(matches!(err, HijackError::UpgradeRefused(_)));
    }

    struct DuplexDialer {
        stream: tokio::sync::Mutex<Option<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl BackendDialer for DuplexDialer {
        async fn dial(&self) -> anyhow::Result<Box<dyn RawStream>> {
            let stream = self
                .stream
                .lock()
                .await
                .take()
                .ok_or_else(|| anyhow::anyhow!("already dialed"))?;
            Ok(Box::new(stream))
        }
    }

    #[tokio::test]
    async fn session_bridges_bytes_both_ways_until_close() {
        let (backend_side, gateway_side) = duplex(1024);
        let dialer = DuplexDialer {
            stream: tokio::sync::Mutex::new(Some(gateway_side)),
        };

        // Fake Docker daemon: accept the upgrade, echo one payload, close.
        let backend = tokio::spawn(async move {
            let mut stream = backend_side;
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("POST /containers/deadbeef/attach"));

            stream
                .write_all(b"HTTP/1.1 101 UPGRADED\r\n\r\n")
                .await
                .unwrap();
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
            // Dropping the stream ends the session.
        });

        let (mut client_far, mut client_near) = duplex(1024);
        let session = tokio::spawn(async move {
            let dialer: &dyn BackendDialer = &dialer;
            run_session(dialer, HijackOp::Attach, "deadbeef", &mut client_near).await
        });

        client_far.write_all(b"ls -la\n").await.unwrap();
        let mut echoed = vec![0u8; 7];
        client_far.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ls -la\n");

        drop(client_far);
        backend.await.unwrap();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_upgrade_aborts_the_session() {
        let (backend_side, gateway_side) = duplex(1024);
        let dialer = DuplexDialer {
            stream: tokio::sync::Mutex::new(Some(gateway_side)),
        };

        let backend = tokio::spawn(async move {
            let mut stream = backend_side;
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let (_client_far, mut client_near) = duplex(1024);
        let err = run_session(&dialer, HijackOp::ExecStart, "cafe01", &mut client_near)
            .await
            .unwrap_err();
        assert!(matches!(err, HijackError::UpgradeRefused(_)));
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_id_is_rejected_before_any_dial() {
        struct NeverDialer;

        #[async_trait]
        impl BackendDialer for NeverDialer {
            async fn dial(&self) -> anyhow::Result<Box<dyn RawStream>> {
                panic!("dial must not happen for invalid ids");
            }
        }

        let (_far, mut near) = duplex(64);
        let err = run_session(&NeverDialer, HijackOp::Attach, "not-hex", &mut near)
            .await
            .unwrap_err();
        assert!(matches!(err, HijackError::InvalidOperationId));
    }
}
