//! # tcp transport
//!
//! why: carry raft rpcs between processes
//! relations: implements the Transport trait from transport/mod.rs; node ids are socket addresses
//! what: TcpTransport, length-prefixed json framing

use raft_core::{NodeId, RaftMessage, RaftReply};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{Inbox, InboundRpc, ListenerGuard, Transport, INBOX_CAPACITY};
use crate::error::TransportError;

/// Upper bound on one frame; larger length prefixes mean a broken peer.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write `value` as a 4-byte big-endian length followed by its JSON encoding.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `None` on a clean end of stream before the length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// One connection per rpc: connect, write the request, read the reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for TcpTransport {
    async fn listen(&self, addr: &NodeId) -> Result<Inbox, TransportError> {
        let listener = TcpListener::bind(addr.as_str()).await?;
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let accept = tokio::spawn(accept_loop(listener, tx));
        // aborting the accept task drops its JoinSet, which aborts every connection
        let guard = ListenerGuard::new(move || accept.abort());
        Ok(Inbox::new(rx, guard))
    }

    async fn send(&self, peer: &NodeId, message: RaftMessage) -> Result<RaftReply, TransportError> {
        let mut stream = TcpStream::connect(peer.as_str())
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &message).await?;
        read_frame(&mut stream).await?.ok_or(TransportError::Closed)
    }
}

async fn accept_loop(listener: TcpListener, inbox: mpsc::Sender<InboundRpc>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "accepted raft connection");
                    connections.spawn(serve_connection(stream, inbox.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(finished) = connections.join_next() => {
                if let Ok(Err(e)) = finished {
                    debug!(error = %e, "raft connection ended with error");
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    inbox: mpsc::Sender<InboundRpc>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    while let Some(message) = read_frame::<_, RaftMessage>(&mut stream).await? {
        let (respond_to, reply) = oneshot::channel();
        if inbox
            .send(InboundRpc {
                message,
                respond_to,
            })
            .await
            .is_err()
        {
            return Err(TransportError::Closed);
        }
        let reply = reply.await.map_err(|_| TransportError::Closed)?;
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}
