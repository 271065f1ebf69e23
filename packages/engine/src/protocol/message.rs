// packages/engine/src/protocol/message.rs
//! Agent message codec
//!
//! Every message starts with the same 24-byte little-endian header:
//!
//! ```text
//! ┌────────┬─────────┬────────┬────────┬──────────────┐
//! │ len u32│ ver u32 │ type   │ op u32 │ sock_id u64  │
//! └────────┴─────────┴────────┴────────┴──────────────┘
//! ```
//!
//! `len` may be larger than the decoded body (padding) but never larger
//! than the buffer. Events flow engine → agent, actions agent → engine.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Stable 64-bit flow identifier: socket generation in the high half,
/// flow hash in the low half
pub type SockId = u64;

pub const CFM_VERSION_CURRENT: u32 = 1;

/// Pass or peek everything
pub const CFM_MAX_OFFSET: u64 = u64::MAX;

pub const MSG_HDR_LEN: usize = 24;

/// DATA_UPDATE and DROP share this layout
pub const ACTION_MSG_LEN: usize = MSG_HDR_LEN + 4 * 8 + 4 + 4;

pub const CLIENT_ID_LEN: usize = 16;
pub const BLESS_MSG_LEN: usize = MSG_HDR_LEN + CLIENT_ID_LEN;

pub const CRYPTO_KEY_LEN: usize = 32;
pub const SET_KEY_MSG_LEN: usize = MSG_HDR_LEN + CRYPTO_KEY_LEN;

pub const SIGNATURE_LEN: usize = 32;

/// Entries in the per-flow op/time log
pub const MAX_TIME_LOG_ENTRIES: usize = 6;

const ENDPOINT_LEN: usize = 20;

/// Message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Event = 1,
    Action = 2,
}

/// Event operations (engine → agent)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventOp {
    SocketAttached = 1,
    SocketClosed = 2,
    DataOut = 3,
    DataIn = 4,
    DisconnectOut = 5,
    DisconnectIn = 6,
    Stats = 7,
}

impl EventOp {
    fn from_u32(op: u32) -> Option<Self> {
        Some(match op {
            1 => EventOp::SocketAttached,
            2 => EventOp::SocketClosed,
            3 => EventOp::DataOut,
            4 => EventOp::DataIn,
            5 => EventOp::DisconnectOut,
            6 => EventOp::DisconnectIn,
            7 => EventOp::Stats,
            _ => return None,
        })
    }
}

/// Action operations (agent → engine)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ActionOp {
    DataUpdate = 16,
    Drop = 17,
    BlessClient = 18,
    SetCryptoKey = 19,
}

impl ActionOp {
    pub fn from_u32(op: u32) -> Option<Self> {
        Some(match op {
            16 => ActionOp::DataUpdate,
            17 => ActionOp::Drop,
            18 => ActionOp::BlessClient,
            19 => ActionOp::SetCryptoKey,
            _ => return None,
        })
    }
}

/// Data direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Out, Direction::In];

    #[inline]
    pub fn is_out(self) -> bool {
        self == Direction::Out
    }

    pub fn data_op(self) -> EventOp {
        match self {
            Direction::Out => EventOp::DataOut,
            Direction::In => EventOp::DataIn,
        }
    }

    pub fn disconnect_op(self) -> EventOp {
        match self {
            Direction::Out => EventOp::DisconnectOut,
            Direction::In => EventOp::DisconnectIn,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "out"),
            Direction::In => write!(f, "in"),
        }
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnDirection {
    In = 0,
    Out = 1,
}

/// Common message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub len: u32,
    pub version: u32,
    pub msg_type: u32,
    pub op: u32,
    pub sock_id: SockId,
}

impl MsgHeader {
    pub fn event(op: EventOp, sock_id: SockId, len: usize) -> Self {
        Self {
            len: len as u32,
            version: CFM_VERSION_CURRENT,
            msg_type: MsgType::Event as u32,
            op: op as u32,
            sock_id,
        }
    }

    pub fn action(op: ActionOp, sock_id: SockId, len: usize) -> Self {
        Self {
            len: len as u32,
            version: CFM_VERSION_CURRENT,
            msg_type: MsgType::Action as u32,
            op: op as u32,
            sock_id,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.msg_type);
        buf.put_u32_le(self.op);
        buf.put_u64_le(self.sock_id);
    }

    /// Read a header; `None` if fewer than 24 bytes
    pub fn parse(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < MSG_HDR_LEN {
            return None;
        }
        Some(Self {
            len: buf.get_u32_le(),
            version: buf.get_u32_le(),
            msg_type: buf.get_u32_le(),
            op: buf.get_u32_le(),
            sock_id: buf.get_u64_le(),
        })
    }
}

/// Reasons an action message is rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    TooShort(usize),
    BadVersion(u32),
    BadType(u32),
    BadLength { len: u32, available: usize },
    BadOp(u32),
    BadOpLength { op: u32, len: u32 },
}

impl DecodeError {
    /// Length errors are counted separately from op errors
    pub fn is_length_error(&self) -> bool {
        matches!(self, DecodeError::BadOpLength { .. })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort(n) => write!(f, "too short {}", n),
            DecodeError::BadVersion(v) => write!(f, "bad version {}", v),
            DecodeError::BadType(t) => write!(f, "bad type {}", t),
            DecodeError::BadLength { len, available } => {
                write!(f, "bad length {} (buffer {})", len, available)
            }
            DecodeError::BadOp(op) => write!(f, "bad op {}", op),
            DecodeError::BadOpLength { op, len } => write!(f, "bad len {} for op {}", len, op),
        }
    }
}

/// Agent verdict or control action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    DataUpdate {
        sock_id: SockId,
        out_pass_offset: u64,
        out_peek_offset: u64,
        in_pass_offset: u64,
        in_peek_offset: u64,
        stats_frequency: u32,
    },
    Drop {
        sock_id: SockId,
    },
    BlessClient {
        sock_id: SockId,
        client_id: [u8; CLIENT_ID_LEN],
    },
    SetCryptoKey {
        key: [u8; CRYPTO_KEY_LEN],
    },
}

impl Action {
    /// Pass-everything verdict
    pub fn pass_all(sock_id: SockId) -> Self {
        Action::DataUpdate {
            sock_id,
            out_pass_offset: CFM_MAX_OFFSET,
            out_peek_offset: CFM_MAX_OFFSET,
            in_pass_offset: CFM_MAX_OFFSET,
            in_peek_offset: CFM_MAX_OFFSET,
            stats_frequency: 0,
        }
    }

    /// Offsets for one direction only, the other left at zero
    pub fn update(sock_id: SockId, dir: Direction, pass: u64, peek: u64) -> Self {
        let (out_pass_offset, out_peek_offset, in_pass_offset, in_peek_offset) = match dir {
            Direction::Out => (pass, peek, 0, 0),
            Direction::In => (0, 0, pass, peek),
        };
        Action::DataUpdate {
            sock_id,
            out_pass_offset,
            out_peek_offset,
            in_pass_offset,
            in_peek_offset,
            stats_frequency: 0,
        }
    }

    pub fn op(&self) -> ActionOp {
        match self {
            Action::DataUpdate { .. } => ActionOp::DataUpdate,
            Action::Drop { .. } => ActionOp::Drop,
            Action::BlessClient { .. } => ActionOp::BlessClient,
            Action::SetCryptoKey { .. } => ActionOp::SetCryptoKey,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACTION_MSG_LEN);
        match self {
            Action::DataUpdate {
                sock_id,
                out_pass_offset,
                out_peek_offset,
                in_pass_offset,
                in_peek_offset,
                stats_frequency,
            } => {
                MsgHeader::action(ActionOp::DataUpdate, *sock_id, ACTION_MSG_LEN).put(&mut buf);
                buf.put_u64_le(*out_pass_offset);
                buf.put_u64_le(*out_peek_offset);
                buf.put_u64_le(*in_pass_offset);
                buf.put_u64_le(*in_peek_offset);
                buf.put_u32_le(*stats_frequency);
                buf.put_u32_le(0);
            }
            Action::Drop { sock_id } => {
                MsgHeader::action(ActionOp::Drop, *sock_id, ACTION_MSG_LEN).put(&mut buf);
                buf.put_bytes(0, ACTION_MSG_LEN - MSG_HDR_LEN);
            }
            Action::BlessClient { sock_id, client_id } => {
                MsgHeader::action(ActionOp::BlessClient, *sock_id, BLESS_MSG_LEN).put(&mut buf);
                buf.put_slice(client_id);
            }
            Action::SetCryptoKey { key } => {
                MsgHeader::action(ActionOp::SetCryptoKey, 0, SET_KEY_MSG_LEN).put(&mut buf);
                buf.put_slice(key);
            }
        }
        buf.freeze()
    }

    /// Validate and decode an action message
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let hdr = MsgHeader::parse(data).ok_or(DecodeError::TooShort(data.len()))?;
        if hdr.version != CFM_VERSION_CURRENT {
            return Err(DecodeError::BadVersion(hdr.version));
        }
        if hdr.msg_type != MsgType::Action as u32 {
            return Err(DecodeError::BadType(hdr.msg_type));
        }
        if hdr.len as usize > data.len() {
            return Err(DecodeError::BadLength {
                len: hdr.len,
                available: data.len(),
            });
        }

        let op = ActionOp::from_u32(hdr.op).ok_or(DecodeError::BadOp(hdr.op))?;
        let expected = match op {
            ActionOp::DataUpdate | ActionOp::Drop => ACTION_MSG_LEN,
            ActionOp::BlessClient => BLESS_MSG_LEN,
            ActionOp::SetCryptoKey => SET_KEY_MSG_LEN,
        };
        if hdr.len as usize != expected {
            return Err(DecodeError::BadOpLength {
                op: hdr.op,
                len: hdr.len,
            });
        }

        let mut body = &data[MSG_HDR_LEN..expected];
        Ok(match op {
            ActionOp::DataUpdate => Action::DataUpdate {
                sock_id: hdr.sock_id,
                out_pass_offset: body.get_u64_le(),
                out_peek_offset: body.get_u64_le(),
                in_pass_offset: body.get_u64_le(),
                in_peek_offset: body.get_u64_le(),
                stats_frequency: body.get_u32_le(),
            },
            ActionOp::Drop => Action::Drop {
                sock_id: hdr.sock_id,
            },
            ActionOp::BlessClient => {
                let mut client_id = [0u8; CLIENT_ID_LEN];
                body.copy_to_slice(&mut client_id);
                Action::BlessClient {
                    sock_id: hdr.sock_id,
                    client_id,
                }
            }
            ActionOp::SetCryptoKey => {
                let mut key = [0u8; CRYPTO_KEY_LEN];
                body.copy_to_slice(&mut key);
                Action::SetCryptoKey { key }
            }
        })
    }
}

/// SOCKET_ATTACHED body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedEvent {
    pub sock_id: SockId,
    pub family: u32,
    pub sock_type: u32,
    pub protocol: u32,
    pub pid: u32,
    pub conn_dir: ConnDirection,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub signature: Bytes,
}

/// DATA_OUT / DATA_IN body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    pub sock_id: SockId,
    pub dir: Direction,
    pub start_offset: u64,
    pub end_offset: u64,
    pub pid: u32,
    pub flags: u32,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub signature: Bytes,
    pub payload: Bytes,
}

/// SOCKET_CLOSED body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedEvent {
    pub sock_id: SockId,
    /// Wall time of the first event, microseconds since the epoch
    pub first_event_us: i64,
    pub op_time: [u32; MAX_TIME_LOG_ENTRIES],
    pub op_list: [u8; MAX_TIME_LOG_ENTRIES],
    pub op_list_ctr: u32,
    pub byte_inbound_count: u64,
    pub byte_outbound_count: u64,
    pub local: Option<SocketAddr>,
    pub signature: Bytes,
}

/// One flow record inside a STATS event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStatsRecord {
    pub sock_id: SockId,
    pub byte_inbound_count: u64,
    pub byte_outbound_count: u64,
    pub local: Option<SocketAddr>,
}

/// Engine → agent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Attached(AttachedEvent),
    Data(DataEvent),
    Disconnect { sock_id: SockId, dir: Direction },
    Closed(ClosedEvent),
    Stats(Vec<FlowStatsRecord>),
}

impl Event {
    pub fn op(&self) -> EventOp {
        match self {
            Event::Attached(_) => EventOp::SocketAttached,
            Event::Data(d) => d.dir.data_op(),
            Event::Disconnect { dir, .. } => dir.disconnect_op(),
            Event::Closed(_) => EventOp::SocketClosed,
            Event::Stats(_) => EventOp::Stats,
        }
    }

    pub fn sock_id(&self) -> SockId {
        match self {
            Event::Attached(e) => e.sock_id,
            Event::Data(e) => e.sock_id,
            Event::Disconnect { sock_id, .. } => *sock_id,
            Event::Closed(e) => e.sock_id,
            Event::Stats(_) => 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Event::Attached(e) => {
                body.put_u32_le(e.family);
                body.put_u32_le(e.sock_type);
                body.put_u32_le(e.protocol);
                body.put_u32_le(e.pid);
                body.put_u32_le(e.conn_dir as u32);
                put_endpoint(&mut body, e.local);
                put_endpoint(&mut body, e.remote);
                put_signature(&mut body, &e.signature);
            }
            Event::Data(e) => {
                body.put_u64_le(e.start_offset);
                body.put_u64_le(e.end_offset);
                body.put_u32_le(e.pid);
                body.put_u32_le(e.flags);
                put_endpoint(&mut body, e.local);
                put_endpoint(&mut body, e.remote);
                put_signature(&mut body, &e.signature);
                body.put_slice(&e.payload);
            }
            Event::Disconnect { .. } => {}
            Event::Closed(e) => {
                body.put_i64_le(e.first_event_us);
                body.put_u32_le(e.op_list_ctr);
                for t in e.op_time {
                    body.put_u32_le(t);
                }
                body.put_slice(&e.op_list);
                body.put_bytes(0, 2);
                body.put_u64_le(e.byte_inbound_count);
                body.put_u64_le(e.byte_outbound_count);
                put_endpoint(&mut body, e.local);
                put_signature(&mut body, &e.signature);
            }
            Event::Stats(records) => {
                body.put_u32_le(records.len() as u32);
                body.put_u32_le(0);
                for r in records {
                    body.put_u64_le(r.sock_id);
                    body.put_u64_le(r.byte_inbound_count);
                    body.put_u64_le(r.byte_outbound_count);
                    put_endpoint(&mut body, r.local);
                }
            }
        }

        let total = MSG_HDR_LEN + body.len();
        let mut buf = BytesMut::with_capacity(total);
        MsgHeader::event(self.op(), self.sock_id(), total).put(&mut buf);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Decode an event, as an agent would
    pub fn decode(data: &[u8]) -> Option<Self> {
        let hdr = MsgHeader::parse(data)?;
        if hdr.version != CFM_VERSION_CURRENT
            || hdr.msg_type != MsgType::Event as u32
            || hdr.len as usize > data.len()
        {
            return None;
        }
        let mut body = &data[MSG_HDR_LEN..hdr.len as usize];
        let op = EventOp::from_u32(hdr.op)?;

        Some(match op {
            EventOp::SocketAttached => {
                if body.remaining() < 20 + 2 * ENDPOINT_LEN + 4 + SIGNATURE_LEN {
                    return None;
                }
                let family = body.get_u32_le();
                let sock_type = body.get_u32_le();
                let protocol = body.get_u32_le();
                let pid = body.get_u32_le();
                let conn_dir = if body.get_u32_le() == ConnDirection::Out as u32 {
                    ConnDirection::Out
                } else {
                    ConnDirection::In
                };
                let local = get_endpoint(&mut body);
                let remote = get_endpoint(&mut body);
                let signature = get_signature(&mut body);
                Event::Attached(AttachedEvent {
                    sock_id: hdr.sock_id,
                    family,
                    sock_type,
                    protocol,
                    pid,
                    conn_dir,
                    local,
                    remote,
                    signature,
                })
            }
            EventOp::DataOut | EventOp::DataIn => {
                if body.remaining() < 24 + 2 * ENDPOINT_LEN + 4 + SIGNATURE_LEN {
                    return None;
                }
                let start_offset = body.get_u64_le();
                let end_offset = body.get_u64_le();
                let pid = body.get_u32_le();
                let flags = body.get_u32_le();
                let local = get_endpoint(&mut body);
                let remote = get_endpoint(&mut body);
                let signature = get_signature(&mut body);
                let payload = Bytes::copy_from_slice(body);
                Event::Data(DataEvent {
                    sock_id: hdr.sock_id,
                    dir: if op == EventOp::DataOut {
                        Direction::Out
                    } else {
                        Direction::In
                    },
                    start_offset,
                    end_offset,
                    pid,
                    flags,
                    local,
                    remote,
                    signature,
                    payload,
                })
            }
            EventOp::DisconnectOut => Event::Disconnect {
                sock_id: hdr.sock_id,
                dir: Direction::Out,
            },
            EventOp::DisconnectIn => Event::Disconnect {
                sock_id: hdr.sock_id,
                dir: Direction::In,
            },
            EventOp::SocketClosed => {
                let need = 12 + 4 * MAX_TIME_LOG_ENTRIES + MAX_TIME_LOG_ENTRIES + 2 + 16
                    + ENDPOINT_LEN
                    + 4
                    + SIGNATURE_LEN;
                if body.remaining() < need {
                    return None;
                }
                let first_event_us = body.get_i64_le();
                let op_list_ctr = body.get_u32_le();
                let mut op_time = [0u32; MAX_TIME_LOG_ENTRIES];
                for t in op_time.iter_mut() {
                    *t = body.get_u32_le();
                }
                let mut op_list = [0u8; MAX_TIME_LOG_ENTRIES];
                body.copy_to_slice(&mut op_list);
                body.advance(2);
                let byte_inbound_count = body.get_u64_le();
                let byte_outbound_count = body.get_u64_le();
                let local = get_endpoint(&mut body);
                let signature = get_signature(&mut body);
                Event::Closed(ClosedEvent {
                    sock_id: hdr.sock_id,
                    first_event_us,
                    op_time,
                    op_list,
                    op_list_ctr,
                    byte_inbound_count,
                    byte_outbound_count,
                    local,
                    signature,
                })
            }
            EventOp::Stats => {
                if body.remaining() < 8 {
                    return None;
                }
                let count = body.get_u32_le() as usize;
                body.advance(4);
                if body.remaining() < count * (24 + ENDPOINT_LEN) {
                    return None;
                }
                let mut records = Vec::with_capacity(count);
                for _ in 0..count {
                    let sock_id = body.get_u64_le();
                    let byte_inbound_count = body.get_u64_le();
                    let byte_outbound_count = body.get_u64_le();
                    let local = get_endpoint(&mut body);
                    records.push(FlowStatsRecord {
                        sock_id,
                        byte_inbound_count,
                        byte_outbound_count,
                        local,
                    });
                }
                Event::Stats(records)
            }
        })
    }
}

fn put_endpoint(buf: &mut BytesMut, addr: Option<SocketAddr>) {
    match addr {
        None => buf.put_bytes(0, ENDPOINT_LEN),
        Some(SocketAddr::V4(a)) => {
            buf.put_u8(4);
            buf.put_u16(a.port());
            let mut raw = [0u8; 16];
            raw[..4].copy_from_slice(&a.ip().octets());
            buf.put_slice(&raw);
            buf.put_u8(0);
        }
        Some(SocketAddr::V6(a)) => {
            buf.put_u8(6);
            buf.put_u16(a.port());
            buf.put_slice(&a.ip().octets());
            buf.put_u8(0);
        }
    }
}

fn get_endpoint(buf: &mut &[u8]) -> Option<SocketAddr> {
    let family = buf.get_u8();
    let port = buf.get_u16();
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    buf.advance(1);
    match family {
        4 => {
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        6 => Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(raw)), port)),
        _ => None,
    }
}

fn put_signature(buf: &mut BytesMut, sig: &Bytes) {
    let len = sig.len().min(SIGNATURE_LEN);
    buf.put_u32_le(len as u32);
    buf.put_slice(&sig[..len]);
    buf.put_bytes(0, SIGNATURE_LEN - len);
}

fn get_signature(buf: &mut &[u8]) -> Bytes {
    let len = (buf.get_u32_le() as usize).min(SIGNATURE_LEN);
    let sig = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(SIGNATURE_LEN);
    sig
}
