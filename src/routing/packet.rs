//! Routed packet framing
//!
//! Every session frame is one packet: a type byte, the receiver's route id
//! (u32, big-endian) and the payload.

use super::addr::RouteId;
use super::control::{control_message, ControlMessage};
use crate::error::{ProtocolError, Result};

/// Packet header length
pub const HEADER_LEN: usize = 5;

/// Kind of packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Application payload on an established route
    Data = 0,
    /// Route control message
    Control = 1,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Control),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// A routed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Kind of packet
    pub packet_type: PacketType,
    /// Route id in the receiver's table (unused for control)
    pub route_id: RouteId,
    /// Body
    pub payload: Vec<u8>,
}

impl Packet {
    /// Data packet for `route_id`
    pub fn data(route_id: RouteId, payload: Vec<u8>) -> Self {
        Self {
            packet_type: PacketType::Data,
            route_id,
            payload,
        }
    }

    /// Control packet carrying `body`
    pub fn control(body: control_message::Body) -> Self {
        Self {
            packet_type: PacketType::Control,
            route_id: RouteId::NONE,
            payload: ControlMessage::new(body).to_bytes(),
        }
    }

    /// Serialize to frame bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.route_id.0.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse frame bytes
    ///
    /// # Errors
    ///
    /// Fails on a short frame or an unknown type byte.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} bytes is shorter than the header",
                frame.len()
            ))
            .into());
        }

        let packet_type = PacketType::try_from(frame[0])?;
        let mut id = [0u8; 4];
        id.copy_from_slice(&frame[1..HEADER_LEN]);

        Ok(Self {
            packet_type,
            route_id: RouteId(u32::from_be_bytes(id)),
            payload: frame[HEADER_LEN..].to_vec(),
        })
    }
}
