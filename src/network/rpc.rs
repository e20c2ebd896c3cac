//! Verb-addressed messages and their wire encoding.

use crate::discovery::DiscoveredNodes;
use crate::error::{NetworkError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Request/response verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Ask a peer for the nodes it knows about.
    DiscoverReq,
    /// Answer to a discovery request.
    DiscoverRsp,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::DiscoverReq => write!(f, "DISCOVER_REQ"),
            Verb::DiscoverRsp => write!(f, "DISCOVER_RSP"),
        }
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Empty discovery request.
    Discover,
    /// Discovery response.
    Discovered(DiscoveredNodes),
}

/// Network message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Correlates a response with its request.
    pub id: u64,

    /// Sender's address.
    pub from: SocketAddr,

    pub verb: Verb,

    pub payload: Payload,
}

impl Message {
    /// Create a discovery request.
    pub fn discover(id: u64, from: SocketAddr) -> Self {
        Self {
            id,
            from,
            verb: Verb::DiscoverReq,
            payload: Payload::Discover,
        }
    }

    /// Build the response to this message.
    pub fn response(&self, from: SocketAddr, verb: Verb, payload: Payload) -> Self {
        Self {
            id: self.id,
            from,
            verb,
            payload,
        }
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| NetworkError::Serialization(e.to_string()).into())
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    bincode::deserialize(data).map_err(|e| NetworkError::Deserialization(e.to_string()).into())
}

/// Frame a message with a big-endian length prefix.
pub fn frame_message(msg: &Message) -> Result<Bytes> {
    let data = encode_message(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::MalformedFrame(format!("message too large: {} bytes", data.len())).into());
    }

    let mut framed = BytesMut::with_capacity(4 + data.len());
    framed.put_u32(data.len() as u32);
    framed.put_slice(&data);
    Ok(framed.freeze())
}

/// Decode one framed message, checking the length prefix.
pub fn unframe_message(mut framed: Bytes) -> Result<Message> {
    if framed.len() < 4 {
        return Err(NetworkError::MalformedFrame("missing length prefix".to_string()).into());
    }
    let len = framed.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::MalformedFrame(format!("frame too large: {} bytes", len)).into());
    }
    if framed.len() != len {
        return Err(NetworkError::MalformedFrame(format!(
            "length prefix {} does not match payload of {} bytes",
            len,
            framed.len()
        ))
        .into());
    }
    decode_message(&framed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryKind;
    use std::collections::BTreeSet;

    fn addr(i: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 100, i], 7000))
    }

    #[test]
    fn test_frame_message() {
        let msg = Message::discover(7, addr(1));
        let framed = frame_message(&msg).unwrap();

        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);
        assert_eq!(unframe_message(framed).unwrap(), msg);
    }

    #[test]
    fn test_response_keeps_id() {
        let req = Message::discover(9, addr(1));
        let nodes: BTreeSet<SocketAddr> = [addr(1), addr(2)].into_iter().collect();
        let rsp = req.response(
            addr(2),
            Verb::DiscoverRsp,
            Payload::Discovered(DiscoveredNodes::new(nodes.clone(), DiscoveryKind::KnownPeers)),
        );
        assert_eq!(rsp.id, 9);
        match unframe_message(frame_message(&rsp).unwrap()).unwrap().payload {
            Payload::Discovered(found) => assert_eq!(found.nodes, nodes),
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let framed = frame_message(&Message::discover(1, addr(1))).unwrap();
        let truncated = framed.slice(..framed.len() - 1);
        assert!(unframe_message(truncated).is_err());
        assert!(unframe_message(Bytes::from_static(&[0, 0])).is_err());
    }
}
