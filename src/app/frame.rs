//! Frames exchanged between the node and a local application
//!
//! Each frame is a protobuf [`AppFrame`] behind a 4-byte big-endian length.
//! The app sends `Hello` (listener mode only), `CreateLoop`, `Data` and
//! `CloseLoop`; the node answers with `LoopConfirmed` / `LoopFailed` and
//! pushes `LoopCreated`, `Data` and `LoopClosed`.

use crate::crypto::PubKey;
use crate::error::{MeshwireError, ProtocolError, Result, TransportError};
use crate::routing::{Addr, LoopAddr};
use crate::transport::session::{receive_framed_message, send_framed_message, MAX_FRAME_SIZE};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};

/// Envelope for app frames
#[derive(Clone, PartialEq, Message)]
pub struct AppFrame {
    /// The frame
    #[prost(oneof = "app_frame::Body", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub body: Option<app_frame::Body>,
}

/// Nested types for [`AppFrame`]
pub mod app_frame {
    /// App frame variants
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        /// App introduces itself
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        /// App asks for a loop to a remote endpoint
        #[prost(message, tag = "2")]
        CreateLoop(super::CreateLoop),
        /// Loop requested by the app is up
        #[prost(message, tag = "3")]
        LoopConfirmed(super::LoopConfirmed),
        /// Loop requested by the app could not be set up
        #[prost(message, tag = "4")]
        LoopFailed(super::LoopFailed),
        /// A remote app opened a loop to this app
        #[prost(message, tag = "5")]
        LoopCreated(super::LoopCreated),
        /// Loop payload
        #[prost(message, tag = "6")]
        Data(super::Data),
        /// App closes a loop
        #[prost(message, tag = "7")]
        CloseLoop(super::CloseLoop),
        /// Loop is gone
        #[prost(message, tag = "8")]
        LoopClosed(super::LoopClosed),
    }
}

/// Loop identity as seen by the app
#[derive(Clone, PartialEq, Message)]
pub struct LoopRef {
    /// Local port of the loop
    #[prost(uint32, tag = "1")]
    pub local_port: u32,
    /// Remote node
    #[prost(bytes = "vec", tag = "2")]
    pub remote_pk: Vec<u8>,
    /// Remote port
    #[prost(uint32, tag = "3")]
    pub remote_port: u32,
}

/// App descriptor sent first on a listener connection
#[derive(Clone, PartialEq, Message)]
pub struct Hello {
    /// App name
    #[prost(string, tag = "1")]
    pub name: String,
    /// App version
    #[prost(string, tag = "2")]
    pub version: String,
    /// Port to bind
    #[prost(uint32, tag = "3")]
    pub port: u32,
}

/// Loop request
#[derive(Clone, PartialEq, Message)]
pub struct CreateLoop {
    /// App-chosen id echoed in the answer
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Remote node
    #[prost(bytes = "vec", tag = "2")]
    pub remote_pk: Vec<u8>,
    /// Remote port
    #[prost(uint32, tag = "3")]
    pub remote_port: u32,
}

/// Answer to [`CreateLoop`] on success
#[derive(Clone, PartialEq, Message)]
pub struct LoopConfirmed {
    /// Id from the request
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// The new loop
    #[prost(message, optional, tag = "2")]
    pub loop_ref: Option<LoopRef>,
}

/// Answer to [`CreateLoop`] on failure
#[derive(Clone, PartialEq, Message)]
pub struct LoopFailed {
    /// Id from the request
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Error text
    #[prost(string, tag = "2")]
    pub reason: String,
}

/// Inbound loop notification
#[derive(Clone, PartialEq, Message)]
pub struct LoopCreated {
    /// The new loop
    #[prost(message, optional, tag = "1")]
    pub loop_ref: Option<LoopRef>,
}

/// Loop payload
#[derive(Clone, PartialEq, Message)]
pub struct Data {
    /// Loop the payload belongs to
    #[prost(message, optional, tag = "1")]
    pub loop_ref: Option<LoopRef>,
    /// Bytes
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Close request from the app
#[derive(Clone, PartialEq, Message)]
pub struct CloseLoop {
    /// Loop to close
    #[prost(message, optional, tag = "1")]
    pub loop_ref: Option<LoopRef>,
}

/// Loop closure notification
#[derive(Clone, PartialEq, Message)]
pub struct LoopClosed {
    /// Closed loop
    #[prost(message, optional, tag = "1")]
    pub loop_ref: Option<LoopRef>,
    /// Why it closed
    #[prost(string, tag = "2")]
    pub reason: String,
}

impl From<LoopAddr> for LoopRef {
    fn from(addr: LoopAddr) -> Self {
        Self {
            local_port: addr.port as u32,
            remote_pk: addr.remote.pk.as_bytes().to_vec(),
            remote_port: addr.remote.port as u32,
        }
    }
}

impl LoopRef {
    /// Parse into a [`LoopAddr`]
    pub fn to_loop_addr(&self) -> Result<LoopAddr> {
        Ok(LoopAddr::new(
            port(self.local_port)?,
            Addr::new(PubKey::from_slice(&self.remote_pk)?, port(self.remote_port)?),
        ))
    }
}

/// Extract the loop address from an optional [`LoopRef`]
pub fn loop_addr_of(loop_ref: &Option<LoopRef>) -> Result<LoopAddr> {
    loop_ref
        .as_ref()
        .ok_or(ProtocolError::EmptyMessage("loop_ref"))?
        .to_loop_addr()
}

impl CreateLoop {
    /// Parsed remote endpoint
    pub fn remote(&self) -> Result<Addr> {
        Ok(Addr::new(
            PubKey::from_slice(&self.remote_pk)?,
            port(self.remote_port)?,
        ))
    }
}

fn port(value: u32) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| ProtocolError::MalformedPacket(format!("port {} out of range", value)).into())
}

/// Write one frame
pub async fn write_app_frame<W>(writer: &mut W, body: app_frame::Body) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = AppFrame { body: Some(body) }.encode_to_vec();
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }
    send_framed_message(writer, &bytes).await
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_app_frame<R>(reader: &mut R) -> Result<Option<app_frame::Body>>
where
    R: AsyncRead + Unpin,
{
    let bytes = match receive_framed_message(reader, MAX_FRAME_SIZE).await {
        Ok(bytes) => bytes,
        Err(MeshwireError::Transport(TransportError::ConnectionReset)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let frame = AppFrame::decode(bytes.as_slice()).map_err(|e| ProtocolError::Decode {
        message: "app frame",
        reason: e.to_string(),
    })?;
    frame
        .body
        .map(Some)
        .ok_or_else(|| ProtocolError::EmptyMessage("app frame").into())
}
