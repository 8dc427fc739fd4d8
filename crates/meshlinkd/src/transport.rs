//! TCP transport. Each frame is a 4-byte big-endian length followed by one
//! JSON-encoded `PeerMessage`.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use meshlink_core::message::{WireError, MAX_FRAME_LEN};
use meshlink_core::{DisconnectReason, HostAddr, PeerId, PeerMessage};
use meshlink_services::{OverlayError, OverlayHandle, PeerLink, SessionId, Transport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
}

// ── Framing ───────────────────────────────────────────────────────────────────

pub fn encode_frame(message: &PeerMessage) -> Result<Bytes, WireError> {
    let body = message.to_bytes()?;
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &PeerMessage,
) -> Result<(), TransportError> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `None` on a clean close between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<PeerMessage>, TransportError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len).into());
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(PeerMessage::from_bytes(&body)?))
}

// ── Links ─────────────────────────────────────────────────────────────────────

enum Outbound {
    Message(PeerMessage),
    Close(DisconnectReason),
}

/// Outbound half of a TCP session. Frames are queued for the writer task.
struct TcpLink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PeerLink for TcpLink {
    fn send(&self, message: PeerMessage) {
        let _ = self.tx.send(Outbound::Message(message));
    }

    fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.tx.send(Outbound::Close(reason));
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<(), TransportError> {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Message(message) => write_frame(&mut writer, &message).await?,
            Outbound::Close(reason) => {
                write_frame(&mut writer, &PeerMessage::Disconnect { reason }).await?;
                break;
            }
        }
    }
    writer.shutdown().await?;
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    session: SessionId,
    handle: &OverlayHandle,
    tx: &mpsc::UnboundedSender<Outbound>,
) -> Result<(), TransportError> {
    loop {
        match read_frame(reader).await {
            Ok(Some(message)) => handle.inbound(session, message).await?,
            Ok(None) => return Ok(()),
            Err(TransportError::Wire(e)) => {
                tracing::warn!(session = %session, error = %e, "bad frame from peer");
                let _ = tx.send(Outbound::Close(DisconnectReason::BadProtocol));
                return Err(e.into());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drive one connected stream until either side closes it.
async fn run_session(
    stream: TcpStream,
    remote: HostAddr,
    outbound: bool,
    handle: OverlayHandle,
) -> Result<(), TransportError> {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let link = Arc::new(TcpLink { tx: tx.clone() });

    let session = handle
        .connection_established(link, remote.clone(), outbound)
        .await?;
    tracing::debug!(session = %session, remote = %remote, outbound, "tcp session up");

    let writer_task = tokio::spawn(async move {
        if let Err(e) = write_loop(writer, rx).await {
            tracing::debug!(error = %e, "writer stopped");
        }
    });
    let result = read_loop(&mut reader, session, &handle, &tx).await;
    drop(tx);
    let _ = writer_task.await;
    let _ = handle.connection_closed(session).await;
    result
}

// ── Transport ─────────────────────────────────────────────────────────────────

pub struct TcpTransport {
    handle: OverlayHandle,
}

impl TcpTransport {
    pub fn new(handle: OverlayHandle) -> Self {
        Self { handle }
    }
}

impl Transport for TcpTransport {
    fn connect(&self, addr: HostAddr, expected: Option<PeerId>) {
        self.connect_to_host(vec![addr], expected);
    }

    fn connect_to_host(&self, hosts: Vec<HostAddr>, expected: Option<PeerId>) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            for host in hosts {
                let attempt = TcpStream::connect((host.address.as_str(), host.port));
                match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
                    Ok(Ok(stream)) => {
                        if let Err(e) = run_session(stream, host.clone(), true, handle).await {
                            tracing::debug!(remote = %host, error = %e, "session ended");
                        }
                        return;
                    }
                    Ok(Err(e)) => tracing::debug!(remote = %host, error = %e, "connect failed"),
                    Err(_) => tracing::debug!(remote = %host, "connect timed out"),
                }
            }
            let _ = handle.connection_failed(expected).await;
        });
    }
}

/// Accept inbound peer sessions until shutdown.
pub async fn accept_loop(
    listener: TcpListener,
    handle: OverlayHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "peer listener ready");
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let remote = HostAddr::new(addr.ip().to_string(), addr.port());
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_session(stream, remote.clone(), false, handle).await {
                        tracing::debug!(remote = %remote, error = %e, "session ended");
                    }
                });
            }
        }
    }
}
