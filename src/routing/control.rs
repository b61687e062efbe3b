//! Route control messages
//!
//! Carried in [`PacketType::Control`](super::PacketType::Control) packets as
//! protobuf. Request ids are scoped to one hop: every node allocates its own
//! id for the request it sends downstream and maps replies back.

use super::addr::{Addr, RouteId};
use crate::crypto::PubKey;
use crate::error::{ProtocolError, Result};
use prost::Message;

/// Envelope for every control message
#[derive(Clone, PartialEq, Message)]
pub struct ControlMessage {
    /// The message
    #[prost(oneof = "control_message::Body", tags = "1, 2, 3, 4")]
    pub body: Option<control_message::Body>,
}

/// Nested types for [`ControlMessage`]
pub mod control_message {
    /// Control message variants
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        /// Ask the next hop to extend a route
        #[prost(message, tag = "1")]
        SetupRequest(super::SetupRequest),
        /// Route installed downstream
        #[prost(message, tag = "2")]
        SetupConfirm(super::SetupConfirm),
        /// Route could not be installed downstream
        #[prost(message, tag = "3")]
        SetupReject(super::SetupReject),
        /// Remove a route
        #[prost(message, tag = "4")]
        CloseRoute(super::CloseRoute),
    }
}

/// Route setup request
#[derive(Clone, PartialEq, Message)]
pub struct SetupRequest {
    /// Id of this request on the sending hop
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Nodes still to traverse after the receiver; empty at the destination
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub hops: Vec<Vec<u8>>,
    /// Initiating node
    #[prost(bytes = "vec", tag = "3")]
    pub src_pk: Vec<u8>,
    /// Initiator's local loop port
    #[prost(uint32, tag = "4")]
    pub src_port: u32,
    /// Destination node
    #[prost(bytes = "vec", tag = "5")]
    pub dst_pk: Vec<u8>,
    /// Destination app port
    #[prost(uint32, tag = "6")]
    pub dst_port: u32,
    /// Route id on the sender that carries traffic back toward the source
    #[prost(uint32, tag = "7")]
    pub upstream_route: u32,
}

/// Route installed on every hop downstream of the receiver
#[derive(Clone, PartialEq, Message)]
pub struct SetupConfirm {
    /// Id of the request being answered (receiver's id)
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Route id on the sender to use for traffic toward the destination
    #[prost(uint32, tag = "2")]
    pub route_id: u32,
}

/// Route refused downstream
#[derive(Clone, PartialEq, Message)]
pub struct SetupReject {
    /// Id of the request being answered (receiver's id)
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Human-readable cause
    #[prost(string, tag = "2")]
    pub reason: String,
}

/// Remove a route on the receiver and beyond
#[derive(Clone, PartialEq, Message)]
pub struct CloseRoute {
    /// Route id on the receiver
    #[prost(uint32, tag = "1")]
    pub route_id: u32,
    /// Why the route is closing
    #[prost(string, tag = "2")]
    pub reason: String,
}

impl ControlMessage {
    /// Wrap a body
    pub fn new(body: control_message::Body) -> Self {
        Self { body: Some(body) }
    }

    /// Serialize to protobuf bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Parse protobuf bytes
    ///
    /// # Errors
    ///
    /// Fails on malformed input or a message without a body.
    pub fn from_bytes(bytes: &[u8]) -> Result<control_message::Body> {
        let msg = ControlMessage::decode(bytes).map_err(|e| ProtocolError::Decode {
            message: "control",
            reason: e.to_string(),
        })?;
        msg.body
            .ok_or_else(|| ProtocolError::EmptyMessage("control").into())
    }
}

impl SetupRequest {
    /// Parsed source endpoint
    pub fn src(&self) -> Result<Addr> {
        Ok(Addr::new(
            PubKey::from_slice(&self.src_pk)?,
            port_field(self.src_port, "src_port")?,
        ))
    }

    /// Parsed destination endpoint
    pub fn dst(&self) -> Result<Addr> {
        Ok(Addr::new(
            PubKey::from_slice(&self.dst_pk)?,
            port_field(self.dst_port, "dst_port")?,
        ))
    }

    /// Parsed remaining hops
    pub fn remaining_hops(&self) -> Result<Vec<PubKey>> {
        self.hops.iter().map(|h| PubKey::from_slice(h)).collect()
    }

    /// Upstream route id
    pub fn upstream(&self) -> RouteId {
        RouteId(self.upstream_route)
    }
}

fn port_field(value: u32, field: &'static str) -> Result<u16> {
    u16::try_from(value).map_err(|_| {
        ProtocolError::MalformedPacket(format!("{} {} out of range", field, value)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_setup_request_fields() {
        let src = Addr::new(KeyPair::generate().pub_key(), 49152);
        let dst = Addr::new(KeyPair::generate().pub_key(), 1);
        let hop = KeyPair::generate().pub_key();

        let req = SetupRequest {
            request_id: 9,
            hops: vec![hop.as_bytes().to_vec()],
            src_pk: src.pk.as_bytes().to_vec(),
            src_port: src.port as u32,
            dst_pk: dst.pk.as_bytes().to_vec(),
            dst_port: dst.port as u32,
            upstream_route: 4,
        };

        let bytes = ControlMessage::new(control_message::Body::SetupRequest(req)).to_bytes();
        match ControlMessage::from_bytes(&bytes).unwrap() {
            control_message::Body::SetupRequest(parsed) => {
                assert_eq!(parsed.src().unwrap(), src);
                assert_eq!(parsed.dst().unwrap(), dst);
                assert_eq!(parsed.remaining_hops().unwrap(), vec![hop]);
                assert_eq!(parsed.upstream(), RouteId(4));
            },
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_empty_envelope_rejected() {
        let bytes = ControlMessage { body: None }.to_bytes();
        assert!(ControlMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ControlMessage::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_out_of_range_port() {
        let req = SetupRequest {
            src_pk: vec![1u8; 32],
            src_port: 70_000,
            ..Default::default()
        };
        assert!(req.src().is_err());
    }
}
