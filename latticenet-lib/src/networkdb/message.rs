//! Wire messages and framing.
//!
//! Every message travels as a frame of one type-tag byte plus a length-prefixed
//! body; a compound message concatenates whole frames inside its own frame.
//! Bodies are bincode-encoded.

use std::net::IpAddr;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Gossip datagrams stay under the conservative ethernet MTU budget.
pub(crate) const MAX_UDP_PAYLOAD: usize = 1400;
/// Upper bound on a single framed body; bulk-sync snapshots travel over TCP
/// and can be large, but not unbounded.
pub(crate) const MAX_FRAME_BODY: usize = 64 << 20;

const FRAME_HEADER_LEN: usize = 5;

const TAG_NETWORK_EVENT: u8 = 1;
const TAG_TABLE_EVENT: u8 = 2;
const TAG_BULK_SYNC_REQUEST: u8 = 3;
const TAG_BULK_SYNC_RESPONSE: u8 = 4;
const TAG_NODE_EVENT: u8 = 5;
const TAG_COMPOUND: u8 = 6;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("truncated frame")]
    Truncated,

    #[error("frame body of {0} bytes exceeds limit")]
    Oversized(usize),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum NodeEventKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum NetworkEventKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum TableEventKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NodeEventMsg {
    pub kind: NodeEventKind,
    pub ltime: u64,
    pub node_id: String,
    pub hostname: String,
    pub addr: IpAddr,
    pub port: u16,
    /// Set on the unicast sent while joining; the receiver answers with a
    /// summary of its node and network state.
    pub reply_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NetworkEventMsg {
    pub kind: NetworkEventKind,
    pub ltime: u64,
    pub node_id: String,
    pub network_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TableEventMsg {
    pub kind: TableEventKind,
    pub ltime: u64,
    /// Owner of the entry.
    pub node_id: String,
    pub network_id: String,
    pub table: String,
    pub key: String,
    pub value: Vec<u8>,
    /// Remaining tombstone lifetime in seconds; non-zero only on deletes
    /// relayed through bulk sync.
    pub residual_reap_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BulkSyncRequestMsg {
    pub ltime: u64,
    pub node_id: String,
    pub networks: Vec<String>,
    /// A compound of table-event frames covering the requested networks.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BulkSyncResponseMsg {
    pub node_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) enum Message {
    NodeEvent(NodeEventMsg),
    NetworkEvent(NetworkEventMsg),
    TableEvent(TableEventMsg),
    BulkSyncRequest(BulkSyncRequestMsg),
    BulkSyncResponse(BulkSyncResponseMsg),
    /// Raw sub-frames, each a complete framed message.
    Compound(Vec<Vec<u8>>),
}

impl Message {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, WireError> {
        let config = bincode::config::standard();
        let (tag, body) = match self {
            Message::NodeEvent(m) => (TAG_NODE_EVENT, bincode::serde::encode_to_vec(m, config)?),
            Message::NetworkEvent(m) => {
                (TAG_NETWORK_EVENT, bincode::serde::encode_to_vec(m, config)?)
            }
            Message::TableEvent(m) => (TAG_TABLE_EVENT, bincode::serde::encode_to_vec(m, config)?),
            Message::BulkSyncRequest(m) => {
                (TAG_BULK_SYNC_REQUEST, bincode::serde::encode_to_vec(m, config)?)
            }
            Message::BulkSyncResponse(m) => {
                (TAG_BULK_SYNC_RESPONSE, bincode::serde::encode_to_vec(m, config)?)
            }
            Message::Compound(frames) => {
                let total = frames.iter().map(Vec::len).sum();
                let mut body = Vec::with_capacity(total);
                for frame in frames {
                    body.extend_from_slice(frame);
                }
                (TAG_COMPOUND, body)
            }
        };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.put_u8(tag);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.to_vec())
    }

    pub(crate) fn decode(frame: &[u8]) -> Result<Message, WireError> {
        let (tag, body) = split_frame(frame)?;
        let config = bincode::config::standard();
        match tag {
            TAG_NODE_EVENT => Ok(Message::NodeEvent(decode_body(body, config)?)),
            TAG_NETWORK_EVENT => Ok(Message::NetworkEvent(decode_body(body, config)?)),
            TAG_TABLE_EVENT => Ok(Message::TableEvent(decode_body(body, config)?)),
            TAG_BULK_SYNC_REQUEST => Ok(Message::BulkSyncRequest(decode_body(body, config)?)),
            TAG_BULK_SYNC_RESPONSE => Ok(Message::BulkSyncResponse(decode_body(body, config)?)),
            TAG_COMPOUND => {
                let mut frames = Vec::new();
                let mut rest = body;
                while !rest.is_empty() {
                    let len = frame_len(rest)?;
                    frames.push(rest[..len].to_vec());
                    rest = &rest[len..];
                }
                Ok(Message::Compound(frames))
            }
            other => Err(WireError::UnknownType(other)),
        }
    }

    /// Total length of the frame whose header starts the slice; used to read
    /// framed messages off a TCP stream.
    pub(crate) fn frame_body_len(header: &[u8; FRAME_HEADER_LEN]) -> Result<usize, WireError> {
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_BODY {
            return Err(WireError::Oversized(len));
        }
        Ok(len)
    }
}

pub(crate) const HEADER_LEN: usize = FRAME_HEADER_LEN;

fn split_frame(frame: &[u8]) -> Result<(u8, &[u8]), WireError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let mut header = frame;
    let tag = header.get_u8();
    let len = header.get_u32() as usize;
    if len > MAX_FRAME_BODY {
        return Err(WireError::Oversized(len));
    }
    if header.len() < len {
        return Err(WireError::Truncated);
    }
    Ok((tag, &header[..len]))
}

fn frame_len(data: &[u8]) -> Result<usize, WireError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let total = FRAME_HEADER_LEN + len;
    if data.len() < total {
        return Err(WireError::Truncated);
    }
    Ok(total)
}

fn decode_body<T: serde::de::DeserializeOwned>(
    body: &[u8],
    config: bincode::config::Configuration,
) -> Result<T, WireError> {
    let (value, _) = bincode::serde::decode_from_slice(body, config)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_event() -> TableEventMsg {
        TableEventMsg {
            kind: TableEventKind::Create,
            ltime: 42,
            node_id: "node-1".to_string(),
            network_id: "net-1".to_string(),
            table: "endpoints".to_string(),
            key: "ep-1".to_string(),
            value: b"payload".to_vec(),
            residual_reap_secs: 0,
        }
    }

    #[test]
    fn table_event_round_trips() {
        let msg = table_event();
        let frame = Message::TableEvent(msg.clone()).encode().unwrap();
        match Message::decode(&frame).unwrap() {
            Message::TableEvent(back) => assert_eq!(back, msg),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn node_event_round_trips() {
        let msg = NodeEventMsg {
            kind: NodeEventKind::Join,
            ltime: 7,
            node_id: "node-2".to_string(),
            hostname: "host-2".to_string(),
            addr: "127.0.0.1".parse().unwrap(),
            port: 7946,
            reply_requested: true,
        };
        let frame = Message::NodeEvent(msg.clone()).encode().unwrap();
        match Message::decode(&frame).unwrap() {
            Message::NodeEvent(back) => assert_eq!(back, msg),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn compound_splits_back_into_frames() {
        let a = Message::TableEvent(table_event()).encode().unwrap();
        let b = Message::NetworkEvent(NetworkEventMsg {
            kind: NetworkEventKind::Join,
            ltime: 1,
            node_id: "n".to_string(),
            network_id: "net".to_string(),
        })
        .encode()
        .unwrap();
        let compound = Message::Compound(vec![a.clone(), b.clone()]).encode().unwrap();
        match Message::decode(&compound).unwrap() {
            Message::Compound(frames) => {
                assert_eq!(frames, vec![a, b]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn truncated_and_unknown_frames_are_rejected() {
        assert!(matches!(Message::decode(&[1, 0, 0]), Err(WireError::Truncated)));
        assert!(matches!(
            Message::decode(&[99, 0, 0, 0, 0]),
            Err(WireError::UnknownType(99))
        ));
        let mut frame = Message::TableEvent(table_event()).encode().unwrap();
        frame.truncate(frame.len() - 1);
        assert!(matches!(Message::decode(&frame), Err(WireError::Truncated)));
    }
}
