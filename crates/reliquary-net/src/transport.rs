//! Peer connection over a framed byte stream
//!
//! A sync session is a strict request/response alternation: the client
//! sends one whole message body, the server replies with one whole body.
//! [`Peer`] is that contract; [`TcpPeer`] speaks it over a TCP stream and
//! [`serve`] is the accept-side loop. Bodies cross this layer
//! uncompressed; the frame codec applies the negotiated content type.

use crate::body::{self, BodyError, ContentType};
use crate::framing::{Frame, FrameCodec, FrameError, FrameKind};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::debug;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Body error: {0}")]
    Body(#[from] BodyError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Unexpected frame kind")]
    UnexpectedFrame,
}

/// One side of a request/response exchange with a remote repository.
pub trait Peer {
    /// Send a complete request body, await the complete response body.
    fn exchange(
        &mut self,
        request: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// A peer over any framed duplex stream.
pub struct FramedPeer<S> {
    framed: Framed<S, FrameCodec>,
    content_type: ContentType,
}

/// A peer over a TCP connection.
pub type TcpPeer = FramedPeer<TcpStream>;

impl TcpPeer {
    /// Connect to a remote repository, compressing bodies by default.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::over(stream, ContentType::Compressed))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FramedPeer<S> {
    /// Wrap an established stream.
    pub fn over(stream: S, content_type: ContentType) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            content_type,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Peer for FramedPeer<S> {
    async fn exchange(&mut self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let payload = body::encode(self.content_type, &request)?;
        debug!(
            raw = request.len(),
            wire = payload.len(),
            "sending sync request"
        );
        self.framed
            .send(Frame::new(FrameKind::Request, self.content_type, payload))
            .await?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or(TransportError::ConnectionClosed)??;
        if frame.kind != FrameKind::Response {
            return Err(TransportError::UnexpectedFrame);
        }
        Ok(body::decode(frame.content_type, &frame.payload)?)
    }
}

/// Serve one connection: decode each request, hand the raw body to
/// `handler`, reply under the same content type the request used.
pub async fn serve<S, F>(stream: S, mut handler: F) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(Vec<u8>) -> Vec<u8>,
{
    let mut framed = Framed::new(stream, FrameCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        if frame.kind != FrameKind::Request {
            return Err(TransportError::UnexpectedFrame);
        }
        let request = body::decode(frame.content_type, &frame.payload)?;
        let reply = handler(request);
        let payload = body::encode(frame.content_type, &reply)?;
        framed
            .send(Frame::new(FrameKind::Response, frame.content_type, payload))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(async move {
            serve(server_io, |req| {
                let mut reply = b"echo: ".to_vec();
                reply.extend_from_slice(&req);
                reply
            })
            .await
        });

        let mut peer = FramedPeer::over(client_io, ContentType::Compressed);
        let reply = peer.exchange(b"pull 0 0\n".to_vec()).await.unwrap();
        assert_eq!(reply, b"echo: pull 0 0\n");

        let reply = peer.exchange(b"second round\n".to_vec()).await.unwrap();
        assert_eq!(reply, b"echo: second round\n");

        drop(peer);
        server.await.unwrap().unwrap();
    }
}
