//! Consensus packets carried inside frames.
//!
//! Every frame payload starts with a one-byte tag followed by a tag-specific
//! body. All lengths are big-endian `u32`. A round is the number of
//! elections the sender had completed when it sent the packet.
//!
//! | Tag  | Packet              | Body                                      |
//! |------|---------------------|-------------------------------------------|
//! | 0x00 | Hello               | `[idLen][id][shardId: u64]`               |
//! | 0x01 | Propose             | `[sigLen][sig][dataLen][JSON(Event)]`     |
//! | 0x02 | Ack                 | `[proofLen][proof]`                       |
//! | 0x03 | Finalize            | `[proofLen][proof]`                       |
//! | 0x04 | Vote                | `[sigLen][sig][round: u64][voteLen][proof]` |
//! | 0x05 | ElectorReady        | `[round: u64]`                            |
//! | 0xA1 | OverwriteEvents     | `[round: u64][len][JSON([Event])]`        |
//! | 0xA2 | AppendTransactions  | `[len][JSON([Transaction])]`              |
//! | 0xFF | Received            | empty                                     |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shardline_core::{Event, NodeId, ShardId, Transaction};
use thiserror::Error;

pub const TAG_HELLO: u8 = 0x00;
pub const TAG_PROPOSE: u8 = 0x01;
pub const TAG_ACK: u8 = 0x02;
pub const TAG_FINALIZE: u8 = 0x03;
pub const TAG_VOTE: u8 = 0x04;
pub const TAG_ELECTOR_READY: u8 = 0x05;
pub const TAG_OVERWRITE_EVENTS: u8 = 0xA1;
pub const TAG_APPEND_TRANSACTIONS: u8 = 0xA2;
pub const TAG_RECEIVED: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("unknown packet tag {0:#04x}")]
    UnknownTag(u8),

    #[error("truncated packet: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),

    #[error("field of {0} bytes does not fit a u32 length prefix")]
    FieldTooLarge(usize),

    #[error("packet field is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("packet JSON body is invalid: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// First frame of a dialed connection: who is calling, for which shard.
    Hello { node_id: NodeId, shard_id: ShardId },

    /// A new signed event from its origin.
    Propose { signature: Vec<u8>, event: Event },

    /// Receiver stored the proof and is ready to finalize it.
    Ack { proof: String },

    /// Every peer acknowledged the proof; an election is pending.
    Finalize { proof: String },

    /// Sender's ballot for the event to commit in `round`.
    Vote {
        round: u64,
        signature: Vec<u8>,
        proof: String,
    },

    /// Sender applied the event committed in `round`.
    ElectorReady { round: u64 },

    /// Pending-event queue after a shard merge or for a late joiner, with
    /// the round the receiver should be at.
    OverwriteEvents { round: u64, events: Vec<Event> },

    /// Leftover transactions handed over after a shard merge.
    AppendTransactions { transactions: Vec<Transaction> },

    /// Transport-level acknowledgement of the last data frame.
    Received,
}

impl Packet {
    pub fn tag(&self) -> u8 {
        match self {
            Packet::Hello { .. } => TAG_HELLO,
            Packet::Propose { .. } => TAG_PROPOSE,
            Packet::Ack { .. } => TAG_ACK,
            Packet::Finalize { .. } => TAG_FINALIZE,
            Packet::Vote { .. } => TAG_VOTE,
            Packet::ElectorReady { .. } => TAG_ELECTOR_READY,
            Packet::OverwriteEvents { .. } => TAG_OVERWRITE_EVENTS,
            Packet::AppendTransactions { .. } => TAG_APPEND_TRANSACTIONS,
            Packet::Received => TAG_RECEIVED,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Hello { .. } => "hello",
            Packet::Propose { .. } => "propose",
            Packet::Ack { .. } => "ack",
            Packet::Finalize { .. } => "finalize",
            Packet::Vote { .. } => "vote",
            Packet::ElectorReady { .. } => "elector-ready",
            Packet::OverwriteEvents { .. } => "overwrite-events",
            Packet::AppendTransactions { .. } => "append-transactions",
            Packet::Received => "received",
        }
    }

    /// Encodes the packet into a frame payload (without the length prefix).
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let mut out = BytesMut::new();
        out.put_u8(self.tag());
        match self {
            Packet::Hello { node_id, shard_id } => {
                put_field(&mut out, node_id.as_bytes())?;
                out.put_u64(shard_id.as_u64());
            }
            Packet::Propose { signature, event } => {
                put_field(&mut out, signature)?;
                put_field(&mut out, &serde_json::to_vec(event)?)?;
            }
            Packet::Ack { proof } | Packet::Finalize { proof } => {
                put_field(&mut out, proof.as_bytes())?;
            }
            Packet::Vote {
                round,
                signature,
                proof,
            } => {
                put_field(&mut out, signature)?;
                out.put_u64(*round);
                put_field(&mut out, proof.as_bytes())?;
            }
            Packet::ElectorReady { round } => out.put_u64(*round),
            Packet::OverwriteEvents { round, events } => {
                out.put_u64(*round);
                put_field(&mut out, &serde_json::to_vec(events)?)?;
            }
            Packet::AppendTransactions { transactions } => {
                put_field(&mut out, &serde_json::to_vec(transactions)?)?;
            }
            Packet::Received => {}
        }
        Ok(out.freeze())
    }

    /// Decodes a frame payload. The whole payload must be consumed.
    pub fn decode(payload: &[u8]) -> Result<Packet, PacketError> {
        let mut buf = payload;
        if !buf.has_remaining() {
            return Err(PacketError::Empty);
        }
        let tag = buf.get_u8();
        let packet = match tag {
            TAG_HELLO => {
                let node_id = NodeId::new(take_string(&mut buf)?);
                Packet::Hello {
                    node_id,
                    shard_id: ShardId(take_u64(&mut buf)?),
                }
            }
            TAG_PROPOSE => {
                let signature = take_field(&mut buf)?.to_vec();
                let event = serde_json::from_slice(take_field(&mut buf)?)?;
                Packet::Propose { signature, event }
            }
            TAG_ACK => Packet::Ack {
                proof: take_string(&mut buf)?,
            },
            TAG_FINALIZE => Packet::Finalize {
                proof: take_string(&mut buf)?,
            },
            TAG_VOTE => {
                let signature = take_field(&mut buf)?.to_vec();
                let round = take_u64(&mut buf)?;
                Packet::Vote {
                    round,
                    signature,
                    proof: take_string(&mut buf)?,
                }
            }
            TAG_ELECTOR_READY => Packet::ElectorReady {
                round: take_u64(&mut buf)?,
            },
            TAG_OVERWRITE_EVENTS => {
                let round = take_u64(&mut buf)?;
                Packet::OverwriteEvents {
                    round,
                    events: serde_json::from_slice(take_field(&mut buf)?)?,
                }
            }
            TAG_APPEND_TRANSACTIONS => Packet::AppendTransactions {
                transactions: serde_json::from_slice(take_field(&mut buf)?)?,
            },
            TAG_RECEIVED => Packet::Received,
            other => return Err(PacketError::UnknownTag(other)),
        };
        if buf.has_remaining() {
            return Err(PacketError::TrailingBytes(buf.remaining()));
        }
        Ok(packet)
    }
}

fn put_field(out: &mut BytesMut, field: &[u8]) -> Result<(), PacketError> {
    let len = u32::try_from(field.len()).map_err(|_| PacketError::FieldTooLarge(field.len()))?;
    out.put_u32(len);
    out.extend_from_slice(field);
    Ok(())
}

fn ensure_remaining(buf: &&[u8], needed: usize) -> Result<(), PacketError> {
    if buf.remaining() < needed {
        return Err(PacketError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn take_field<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], PacketError> {
    ensure_remaining(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure_remaining(buf, len)?;
    let remaining: &'a [u8] = *buf;
    let (field, rest) = remaining.split_at(len);
    *buf = rest;
    Ok(field)
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, PacketError> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_u64())
}

fn take_string(buf: &mut &[u8]) -> Result<String, PacketError> {
    Ok(String::from_utf8(take_field(buf)?.to_vec())?)
}
