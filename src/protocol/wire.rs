use std::net::SocketAddr;

use anyhow::bail;
use bytes::{Buf, Bytes};

use crate::protocol::header::ByteOrder;
use crate::util::buf_ext::{socket_addr_from_wire, LONG_SIZE, NULL_SIZE};

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $be: ident, $le: ident) => {
        pub fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.buf.remaining() < size_of::<$ty>() {
                bail!("buffer underflow reading {}", stringify!($ty));
            }
            Ok(match self.order {
                ByteOrder::BigEndian => self.buf.$be(),
                ByteOrder::LittleEndian => self.buf.$le(),
            })
        }
    }
}

/// A read cursor over a received payload that decodes numbers in the byte order the peer
///  announced in the message header. All reads are checked: reading past the end is an error
///  rather than a panic, so a truncated or malicious payload only affects its own message.
#[derive(Clone, Debug)]
pub struct WireBuf {
    buf: Bytes,
    order: ByteOrder,
}

impl WireBuf {
    pub fn new(buf: Bytes, order: ByteOrder) -> WireBuf {
        WireBuf { buf, order }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// the unread rest of the payload
    pub fn rest(&self) -> &Bytes {
        &self.buf
    }

    pub fn try_get_u8(&mut self) -> anyhow::Result<u8> {
        if self.buf.is_empty() {
            bail!("buffer underflow reading u8");
        }
        Ok(self.buf.get_u8())
    }

    pub fn try_get_i8(&mut self) -> anyhow::Result<i8> {
        Ok(self.try_get_u8()? as i8)
    }

    get_try_impl!(try_get_u16, u16, get_u16, get_u16_le);
    get_try_impl!(try_get_i16, i16, get_i16, get_i16_le);
    get_try_impl!(try_get_u32, u32, get_u32, get_u32_le);
    get_try_impl!(try_get_i32, i32, get_i32, get_i32_le);
    get_try_impl!(try_get_u64, u64, get_u64, get_u64_le);
    get_try_impl!(try_get_i64, i64, get_i64, get_i64_le);

    pub fn try_get_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.buf.remaining() < len {
            bail!("buffer underflow: {} bytes requested, {} available", len, self.buf.remaining());
        }
        Ok(self.buf.split_to(len))
    }

    pub fn try_get_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        let mut result = [0u8; N];
        result.copy_from_slice(&self.try_get_bytes(N)?);
        Ok(result)
    }

    pub fn skip(&mut self, len: usize) -> anyhow::Result<()> {
        self.try_get_bytes(len).map(|_| ())
    }

    /// Reads a size in the protocol's compact encoding. `None` is the null marker.
    pub fn try_get_size(&mut self) -> anyhow::Result<Option<usize>> {
        match self.try_get_u8()? {
            NULL_SIZE => Ok(None),
            LONG_SIZE => {
                let size = self.try_get_i32()?;
                if size < 0 {
                    bail!("negative size {}", size);
                }
                Ok(Some(size as usize))
            }
            size => Ok(Some(size as usize)),
        }
    }

    /// Reads a string, treating a null string as empty
    pub fn try_get_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_size()?.unwrap_or(0);
        let bytes = self.try_get_bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub fn try_get_socket_addr(&mut self) -> anyhow::Result<SocketAddr> {
        let octets = self.try_get_array::<16>()?;
        let port = self.try_get_u16()?;
        Ok(socket_addr_from_wire(octets, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::buf_ext::BufMutExt;
    use bytes::{BufMut, BytesMut};
    use rstest::rstest;

    #[rstest]
    #[case::big_endian(ByteOrder::BigEndian, vec![0, 0, 1, 2], 0x0102)]
    #[case::little_endian(ByteOrder::LittleEndian, vec![2, 1, 0, 0], 0x0102)]
    fn test_byte_order(#[case] order: ByteOrder, #[case] bytes: Vec<u8>, #[case] expected: u32) {
        let mut buf = WireBuf::new(Bytes::from(bytes), order);
        assert_eq!(buf.try_get_u32().unwrap(), expected);
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::short(5)]
    #[case::boundary(253)]
    #[case::long(254)]
    #[case::longer(100_000)]
    fn test_size(#[case] size: usize) {
        let mut raw = BytesMut::new();
        raw.put_size(size);
        raw.put_null_size();
        let mut buf = WireBuf::new(raw.freeze(), ByteOrder::BigEndian);
        assert_eq!(buf.try_get_size().unwrap(), Some(size));
        assert_eq!(buf.try_get_size().unwrap(), None);
    }

    #[test]
    fn test_string() {
        let mut raw = BytesMut::new();
        raw.put_string("abc");
        raw.put_null_size();
        raw.put_string("");
        let mut buf = WireBuf::new(raw.freeze(), ByteOrder::BigEndian);
        assert_eq!(buf.try_get_string().unwrap(), "abc");
        assert_eq!(buf.try_get_string().unwrap(), "");
        assert_eq!(buf.try_get_string().unwrap(), "");
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::u16(vec![1])]
    #[case::empty(vec![])]
    fn test_underflow(#[case] bytes: Vec<u8>) {
        let mut buf = WireBuf::new(Bytes::from(bytes), ByteOrder::BigEndian);
        assert!(buf.try_get_u16().is_err());
    }

    #[test]
    fn test_string_truncated() {
        let mut raw = BytesMut::new();
        raw.put_u8(10);
        raw.put_slice(b"abc");
        let mut buf = WireBuf::new(raw.freeze(), ByteOrder::BigEndian);
        assert!(buf.try_get_string().is_err());
    }

    #[test]
    fn test_negative_long_size() {
        let mut raw = BytesMut::new();
        raw.put_u8(LONG_SIZE);
        raw.put_i32(-5);
        let mut buf = WireBuf::new(raw.freeze(), ByteOrder::BigEndian);
        assert!(buf.try_get_size().is_err());
    }
}
