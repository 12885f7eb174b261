//! Request/response payloads carried inside frames

use crate::framing::{Frame, FrameError, FrameType};
use peerstate_core::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A payload bound to one frame type.
pub trait WireMessage: Serialize + DeserializeOwned {
    const FRAME_TYPE: FrameType;

    fn to_frame(&self) -> Result<Frame, FrameError> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(Self::FRAME_TYPE, payload))
    }

    fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        if frame.frame_type != Self::FRAME_TYPE {
            return Err(FrameError::UnexpectedType {
                expected: Self::FRAME_TYPE,
                got: frame.frame_type,
            });
        }
        Ok(postcard::from_bytes(&frame.payload)?)
    }
}

macro_rules! wire_message {
    ($ty:ty, $frame:ident) => {
        impl WireMessage for $ty {
            const FRAME_TYPE: FrameType = FrameType::$frame;
        }
    };
}

/// Identity exchange: who am I and where can I be reached
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub address: NodeAddress,
    pub endpoint: String,
}

/// Reply to [`Hello`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub address: NodeAddress,
    pub endpoint: String,
}

/// Ask the remote to add the sender to its membership table
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub address: NodeAddress,
    pub endpoint: String,
    /// Unix millis when the request was signed
    pub issued_at: u64,
    /// Signature by `address` over [`JoinRequest::sign_bytes`]
    pub signature: Vec<u8>,
    /// Sender's current view, pushed as part of the initial exchange
    pub states: Vec<StateMessage>,
}

impl JoinRequest {
    pub fn sign_bytes(&self) -> Vec<u8> {
        peerstate_core::crypto::join_sign_bytes(&self.address, self.issued_at, &self.endpoint)
    }
}

/// Reply to [`JoinRequest`] carrying the remote's full view
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinAck {
    pub address: NodeAddress,
    pub states: Vec<StateMessage>,
}

/// Announce that the sender is leaving
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub address: NodeAddress,
    pub issued_at: u64,
    /// Signature by `address`; nobody can remove a peer but itself
    pub signature: Vec<u8>,
}

impl LeaveRequest {
    pub fn sign_bytes(&self) -> Vec<u8> {
        peerstate_core::crypto::leave_sign_bytes(&self.address, self.issued_at)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveAck;

/// Push one signed state message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushRequest {
    pub message: StateMessage,
    /// Hashes the pusher asserts the receiver need not fetch
    pub known: Vec<ContentHash>,
    /// Peer relaying the message; content is fetched from it
    pub relayer: Option<Hello>,
}

/// Outcome of a push on the receiving side
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushResult {
    Accepted { fetched: u32 },
    Stale,
    Rejected { reason: String, retryable: bool },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullStateRequest;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullStateResponse {
    pub states: Vec<StateMessage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockRequest {
    pub hash: ContentHash,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockResponse {
    pub block: Option<ContentBlock>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinksRequest {
    pub hash: ContentHash,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinksResponse {
    pub children: Option<Vec<ContentHash>>,
}

/// Remote-side failure
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

wire_message!(Hello, Hello);
wire_message!(HelloAck, HelloAck);
wire_message!(JoinRequest, Join);
wire_message!(JoinAck, JoinAck);
wire_message!(LeaveRequest, Leave);
wire_message!(LeaveAck, LeaveAck);
wire_message!(PushRequest, PushState);
wire_message!(PushResult, PushResult);
wire_message!(FullStateRequest, FullStateRequest);
wire_message!(FullStateResponse, FullStateResponse);
wire_message!(BlockRequest, BlockRequest);
wire_message!(BlockResponse, BlockResponse);
wire_message!(LinksRequest, LinksRequest);
wire_message!(LinksResponse, LinksResponse);
wire_message!(ErrorResponse, Error);
