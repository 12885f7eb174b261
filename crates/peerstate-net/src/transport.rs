//! Peer transport
//!
//! [`PeerClient`] is the outbound side of the protocol: every call is one
//! request/response round trip to a peer endpoint. [`TcpPeerClient`] speaks
//! the framed wire format over TCP; tests substitute in-memory clients.

use crate::framing::{read_frame, write_frame, Frame, FrameError, FrameType};
use crate::messages::*;
use async_trait::async_trait;
use peerstate_core::*;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out talking to {0}")]
    Timeout(String),
    #[error("Remote error: {0}")]
    Remote(String),
}

/// Outbound protocol calls to a single peer endpoint.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Exchange identities
    async fn hello(&self, endpoint: &str, local: Hello) -> Result<HelloAck, TransportError>;

    /// Register with the remote and swap full views
    async fn join(&self, endpoint: &str, request: JoinRequest) -> Result<JoinAck, TransportError>;

    /// Tell the remote we are leaving
    async fn leave(&self, endpoint: &str, request: LeaveRequest) -> Result<(), TransportError>;

    /// Push one signed state message
    async fn push_state(
        &self,
        endpoint: &str,
        request: PushRequest,
    ) -> Result<PushResult, TransportError>;

    /// Pull every state message the remote holds
    async fn fetch_full_state(&self, endpoint: &str) -> Result<Vec<StateMessage>, TransportError>;

    /// Fetch one block with its child links
    async fn fetch_block(
        &self,
        endpoint: &str,
        hash: ContentHash,
    ) -> Result<Option<ContentBlock>, TransportError>;

    /// Fetch only the child links of a block
    async fn fetch_links(
        &self,
        endpoint: &str,
        hash: ContentHash,
    ) -> Result<Option<Vec<ContentHash>>, TransportError>;
}

/// [`PeerClient`] over plain TCP, one connection per request
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    io_timeout: Duration,
}

impl TcpPeerClient {
    /// Create a client; `io_timeout` bounds connect and each round trip
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    async fn round_trip<Req, Resp>(&self, endpoint: &str, request: &Req) -> Result<Resp, TransportError>
    where
        Req: WireMessage + Sync,
        Resp: WireMessage,
    {
        let frame = request.to_frame()?;
        let response = timeout(self.io_timeout, self.exchange(endpoint, frame))
            .await
            .map_err(|_| TransportError::Timeout(endpoint.to_string()))??;

        if response.frame_type == FrameType::Error {
            let err = ErrorResponse::from_frame(&response)?;
            return Err(TransportError::Remote(err.message));
        }
        Ok(Resp::from_frame(&response)?)
    }

    async fn exchange(&self, endpoint: &str, frame: Frame) -> Result<Frame, TransportError> {
        debug!("-> {} {:?}", endpoint, frame.frame_type);
        let mut stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, frame).await?;
        read_frame(&mut stream)
            .await?
            .ok_or(TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn hello(&self, endpoint: &str, local: Hello) -> Result<HelloAck, TransportError> {
        self.round_trip(endpoint, &local).await
    }

    async fn join(&self, endpoint: &str, request: JoinRequest) -> Result<JoinAck, TransportError> {
        self.round_trip(endpoint, &request).await
    }

    async fn leave(&self, endpoint: &str, request: LeaveRequest) -> Result<(), TransportError> {
        let _: LeaveAck = self.round_trip(endpoint, &request).await?;
        Ok(())
    }

    async fn push_state(
        &self,
        endpoint: &str,
        request: PushRequest,
    ) -> Result<PushResult, TransportError> {
        self.round_trip(endpoint, &request).await
    }

    async fn fetch_full_state(&self, endpoint: &str) -> Result<Vec<StateMessage>, TransportError> {
        let response: FullStateResponse = self.round_trip(endpoint, &FullStateRequest).await?;
        Ok(response.states)
    }

    async fn fetch_block(
        &self,
        endpoint: &str,
        hash: ContentHash,
    ) -> Result<Option<ContentBlock>, TransportError> {
        let response: BlockResponse = self.round_trip(endpoint, &BlockRequest { hash }).await?;
        Ok(response.block)
    }

    async fn fetch_links(
        &self,
        endpoint: &str,
        hash: ContentHash,
    ) -> Result<Option<Vec<ContentHash>>, TransportError> {
        let response: LinksResponse = self.round_trip(endpoint, &LinksRequest { hash }).await?;
        Ok(response.children)
    }
}
