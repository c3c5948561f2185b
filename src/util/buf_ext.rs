use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Marker for a null / absent size, e.g. a null string or an absent type description
pub const NULL_SIZE: u8 = 0xFF;
/// A size byte of this value is followed by the actual size as a 32-bit integer
pub const LONG_SIZE: u8 = 0xFE;

/// Writing helpers for the protocol's compound encodings. Everything is written in the buffer's
///  native (big endian) byte order.
pub trait BufMutExt: bytes::BufMut {
    /// Sizes below 254 take a single byte, bigger sizes are prefixed by a 254 marker byte and
    ///  written as i32.
    fn put_size(&mut self, size: usize) {
        if size < LONG_SIZE as usize {
            self.put_u8(size as u8);
        }
        else {
            self.put_u8(LONG_SIZE);
            self.put_i32(size.try_into().unwrap_or(i32::MAX));
        }
    }

    fn put_null_size(&mut self) {
        self.put_u8(NULL_SIZE);
    }

    fn put_string(&mut self, s: &str) {
        self.put_size(s.len());
        self.put_slice(s.as_bytes());
    }

    /// Addresses are always written as 16 bytes IPv6 (with V4 addresses mapped) followed by
    ///  a u16 port.
    fn put_socket_addr(&mut self, addr: &SocketAddr) {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };
        self.put_slice(&ip.octets());
        self.put_u16(addr.port());
    }
}

impl <T: bytes::BufMut> BufMutExt for T {
}

/// The reverse of [BufMutExt::put_socket_addr]: IPv4-mapped addresses are turned back into
///  IPv4 addresses.
pub fn socket_addr_from_wire(octets: [u8; 16], port: u16) -> SocketAddr {
    let ip = Ipv6Addr::from(octets);
    match ip.to_ipv4_mapped() {
        Some(v4) => SocketAddr::new(IpAddr::V4(v4), port),
        None => SocketAddr::new(IpAddr::V6(ip), port),
    }
}
