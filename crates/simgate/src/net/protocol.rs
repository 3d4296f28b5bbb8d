use bitflags::bitflags;
use rkyv::rancor;
use rkyv::util::AlignedVec;

use super::message::{Message, MessageKind};

pub const MAX_PACKET_SIZE: usize = 1400;
pub const MIN_PACKET_SIZE: usize = 10;
pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_HTTP_PORT: u16 = 9001;
pub const MAX_APPENDED_ACKS: usize = 255;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;
const FLAGS_OFFSET: usize = 0;
const SEQUENCE_OFFSET: usize = 1;
const EXTRA_OFFSET: usize = 5;
const KIND_OFFSET: usize = 6;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const ZEROCODED = 0x80;
        const RELIABLE = 0x40;
        const RESENT = 0x20;
        const ACK = 0x10;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    pub acks: Vec<u32>,
}

impl PacketHeader {
    pub fn new(sequence: u32, reliable: bool) -> Self {
        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::RELIABLE, reliable);
        Self {
            flags,
            sequence,
            acks: Vec::new(),
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("packet of {0} bytes is below the minimum header size")]
    Undersized(usize),
    #[error("packet of {0} bytes exceeds the MTU")]
    Oversized(usize),
    #[error("unknown message id {0:#x}")]
    UnknownKind(u32),
    #[error("header declares {header:?} but body holds {body:?}")]
    KindMismatch {
        header: MessageKind,
        body: MessageKind,
    },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("{0} appended acks exceed the per-packet limit")]
    TooManyAcks(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub message: Message,
}

impl Packet {
    pub fn new(header: PacketHeader, message: Message) -> Self {
        Self { header, message }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let kind = self.message.kind();
        let body = rkyv::to_bytes::<rancor::Error>(&self.message).map_err(PacketError::Serialize)?;

        let acks = &self.header.acks;
        if acks.len() > MAX_APPENDED_ACKS {
            return Err(PacketError::TooManyAcks(acks.len()));
        }

        let mut flags = self.header.flags;
        flags.set(PacketFlags::ACK, !acks.is_empty());
        flags.set(PacketFlags::ZEROCODED, kind.zerocoded());

        let mut data = Vec::with_capacity(MIN_PACKET_SIZE + body.len() + acks.len() * 4 + 1);
        data.push(flags.bits());
        data.extend_from_slice(&self.header.sequence.to_be_bytes());
        data.push(0);
        data.extend_from_slice(&kind.id().to_be_bytes());
        if kind.zerocoded() {
            data.extend_from_slice(&zero_encode(&body));
        } else {
            data.extend_from_slice(&body);
        }

        if !acks.is_empty() {
            for ack in acks {
                data.extend_from_slice(&ack.to_be_bytes());
            }
            data.push(acks.len() as u8);
        }

        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::Oversized(data.len()));
        }

        Ok(data)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        let kind_offset = body_offset(data)? - 4;
        let flags = PacketFlags::from_bits_truncate(data[FLAGS_OFFSET]);
        let sequence = read_u32(data, SEQUENCE_OFFSET)?;
        let kind_id = read_u32(data, kind_offset)?;
        let kind = MessageKind::from_id(kind_id).ok_or(PacketError::UnknownKind(kind_id))?;

        let body_start = kind_offset + 4;
        let mut body_end = data.len();
        let mut acks = Vec::new();

        if flags.contains(PacketFlags::ACK) {
            let count = data[body_end - 1] as usize;
            let ack_bytes = count * 4;
            if body_end - 1 < body_start + ack_bytes {
                return Err(PacketError::Malformed("appended acks overlap the header"));
            }
            let ack_start = body_end - 1 - ack_bytes;
            acks.reserve(count);
            for i in 0..count {
                acks.push(read_u32(data, ack_start + i * 4)?);
            }
            body_end = ack_start;
        }

        let raw_body = &data[body_start..body_end];
        let mut body = AlignedVec::<16>::with_capacity(raw_body.len());
        if flags.contains(PacketFlags::ZEROCODED) {
            body.extend_from_slice(&zero_decode(raw_body)?);
        } else {
            body.extend_from_slice(raw_body);
        }

        let message =
            rkyv::from_bytes::<Message, rancor::Error>(&body).map_err(PacketError::Deserialize)?;
        if message.kind() != kind {
            return Err(PacketError::KindMismatch {
                header: kind,
                body: message.kind(),
            });
        }

        Ok(Self {
            header: PacketHeader {
                flags,
                sequence,
                acks,
            },
            message,
        })
    }

    /// Reads only the message id, leaving the body untouched.
    pub fn peek_kind(data: &[u8]) -> Result<MessageKind, PacketError> {
        let kind_offset = body_offset(data)? - 4;
        let kind_id = read_u32(data, kind_offset)?;
        MessageKind::from_id(kind_id).ok_or(PacketError::UnknownKind(kind_id))
    }
}

fn body_offset(data: &[u8]) -> Result<usize, PacketError> {
    if data.len() < MIN_PACKET_SIZE {
        return Err(PacketError::Undersized(data.len()));
    }
    let offset = KIND_OFFSET + data[EXTRA_OFFSET] as usize + 4;
    if data.len() < offset {
        return Err(PacketError::Malformed("extra header runs past the end"));
    }
    Ok(offset)
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, PacketError> {
    data.get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(PacketError::Malformed("truncated field"))
}

pub fn zero_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros: u8 = 0;

    for &byte in data {
        if byte == 0 {
            if zeros == u8::MAX {
                out.push(0);
                out.push(zeros);
                zeros = 0;
            }
            zeros += 1;
            continue;
        }
        if zeros > 0 {
            out.push(0);
            out.push(zeros);
            zeros = 0;
        }
        out.push(byte);
    }

    if zeros > 0 {
        out.push(0);
        out.push(zeros);
    }
    out
}

pub fn zero_decode(data: &[u8]) -> Result<Vec<u8>, PacketError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut bytes = data.iter();

    while let Some(&byte) = bytes.next() {
        if byte != 0 {
            out.push(byte);
            continue;
        }
        let count = *bytes
            .next()
            .ok_or(PacketError::Malformed("zero run without a count"))?;
        out.resize(out.len() + count as usize, 0);
    }
    Ok(out)
}
