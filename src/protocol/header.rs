use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bitflags::bitflags;
use bytes::BufMut;

pub const MAGIC: u8 = 0xCA;

/// The protocol revision this crate speaks. The revision used on a connection is the minimum
///  of this and the peer's revision.
pub const PROTOCOL_REVISION: u8 = 2;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct HeaderFlags: u8 {
        const CONTROL        = 0b0000_0001;
        const SEGMENT_MASK   = 0b0011_0000;
        const SEGMENT_FIRST  = 0b0001_0000;
        const SEGMENT_LAST   = 0b0010_0000;
        const SEGMENT_MIDDLE = 0b0011_0000;
        const FROM_SERVER    = 0b0100_0000;
        const BIG_ENDIAN     = 0b1000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Unsegmented,
    First,
    Middle,
    Last,
}

impl Segment {
    fn flags(&self) -> HeaderFlags {
        match self {
            Segment::Unsegmented => HeaderFlags::empty(),
            Segment::First => HeaderFlags::SEGMENT_FIRST,
            Segment::Middle => HeaderFlags::SEGMENT_MIDDLE,
            Segment::Last => HeaderFlags::SEGMENT_LAST,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub flags: HeaderFlags,
    pub command: u8,
    /// For control messages, this field carries the control message's value rather than a size
    pub payload_size: u32,
}

impl Debug for MessageHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_control() { "CTRL" } else { "MSG" };
        write!(f, "{}{{V{}:{}:{:?}:{}}}", kind, self.version, self.command, self.segment(), self.payload_size)
    }
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = 8;

    /// an outgoing (client, big endian) application message header
    pub fn application(command: u8, payload_size: u32, segment: Segment) -> MessageHeader {
        MessageHeader {
            version: PROTOCOL_REVISION,
            flags: HeaderFlags::BIG_ENDIAN | segment.flags(),
            command,
            payload_size,
        }
    }

    pub fn control(command: u8, value: u32) -> MessageHeader {
        MessageHeader {
            version: PROTOCOL_REVISION,
            flags: HeaderFlags::BIG_ENDIAN | HeaderFlags::CONTROL,
            command,
            payload_size: value,
        }
    }

    /// marks the header as sent by a server - only relevant for tests and tools that play
    ///  the server role
    pub fn from_server(mut self) -> MessageHeader {
        self.flags |= HeaderFlags::FROM_SERVER;
        self
    }

    pub fn is_control(&self) -> bool {
        self.flags.contains(HeaderFlags::CONTROL)
    }

    pub fn is_from_server(&self) -> bool {
        self.flags.contains(HeaderFlags::FROM_SERVER)
    }

    pub fn segment(&self) -> Segment {
        let segment_bits = self.flags & HeaderFlags::SEGMENT_MASK;
        if segment_bits == HeaderFlags::SEGMENT_MIDDLE {
            Segment::Middle
        }
        else if segment_bits == HeaderFlags::SEGMENT_FIRST {
            Segment::First
        }
        else if segment_bits == HeaderFlags::SEGMENT_LAST {
            Segment::Last
        }
        else {
            Segment::Unsegmented
        }
    }

    pub fn with_segment(mut self, segment: Segment) -> MessageHeader {
        self.flags.remove(HeaderFlags::SEGMENT_MASK);
        self.flags |= segment.flags();
        self
    }

    pub fn byte_order(&self) -> ByteOrder {
        if self.flags.contains(HeaderFlags::BIG_ENDIAN) {
            ByteOrder::BigEndian
        }
        else {
            ByteOrder::LittleEndian
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.command);
        match self.byte_order() {
            ByteOrder::BigEndian => buf.put_u32(self.payload_size),
            ByteOrder::LittleEndian => buf.put_u32_le(self.payload_size),
        }
    }

    /// Parses a header from the first [MessageHeader::SERIALIZED_LEN] bytes of `buf`. The caller
    ///  is responsible for providing enough bytes.
    ///
    /// A wrong magic byte means the stream is out of sync, and there is no way to recover from
    ///  that on a byte stream.
    pub fn deser(buf: &[u8]) -> anyhow::Result<MessageHeader> {
        if buf.len() < Self::SERIALIZED_LEN {
            bail!("truncated header: {} bytes", buf.len());
        }
        if buf[0] != MAGIC {
            bail!("invalid magic byte {:#04x}", buf[0]);
        }

        let flags = HeaderFlags::from_bits_retain(buf[2]);
        let size_bytes = [buf[4], buf[5], buf[6], buf[7]];
        let payload_size = if flags.contains(HeaderFlags::BIG_ENDIAN) {
            u32::from_be_bytes(size_bytes)
        }
        else {
            u32::from_le_bytes(size_bytes)
        };

        Ok(MessageHeader {
            version: buf[1],
            flags,
            command: buf[3],
            payload_size,
        })
    }
}
