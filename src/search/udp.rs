//! The UDP side of name resolution: sending search frames, and receiving search responses
//!  and beacons.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, instrument, trace, warn};

use crate::protocol::command::Command;
use crate::protocol::header::MessageHeader;
use crate::protocol::messages::{unspecified_addr, InboundMessage};
use crate::protocol::wire::WireBuf;
use crate::util::safe_converter::SafeCast;

/// The send primitive the search manager depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SearchSocket: Send + Sync + 'static {
    async fn send_search(&self, to: SocketAddr, frame: &[u8]);

    /// the address servers should send responses to
    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SearchSocket for UdpSocket {
    async fn send_search(&self, to: SocketAddr, frame: &[u8]) {
        if let Err(e) = self.send_to(frame, to).await {
            error!("error sending search frame to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        match UdpSocket::local_addr(self) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("could not determine local search address: {}", e);
                unspecified_addr(0)
            }
        }
    }
}

/// A UDP socket that may send broadcasts. Several clients on the same host may bind the same
///  port, which is what beacon listeners do.
pub fn bind_udp(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

pub fn bind_search_socket() -> anyhow::Result<UdpSocket> {
    bind_udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
}

pub fn bind_beacon_socket(port: u16) -> anyhow::Result<UdpSocket> {
    bind_udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
}

/// Splits a datagram into its messages, keeping only those that are relevant on the UDP side
///  of a client. Decoding stops at the first malformed message.
pub fn decode_datagram(mut datagram: Bytes) -> Vec<InboundMessage> {
    let mut result = Vec::new();
    while datagram.len() >= MessageHeader::SERIALIZED_LEN {
        let header = match MessageHeader::deser(&datagram) {
            Ok(h) => h,
            Err(e) => {
                debug!("invalid datagram header - dropping the rest: {}", e);
                break;
            }
        };
        let payload_size: usize = header.payload_size.safe_cast();
        if header.is_control() || datagram.len() < MessageHeader::SERIALIZED_LEN + payload_size {
            debug!("truncated or control message in datagram - dropping the rest");
            break;
        }
        let payload = datagram.slice(MessageHeader::SERIALIZED_LEN..MessageHeader::SERIALIZED_LEN + payload_size);
        datagram = datagram.slice(MessageHeader::SERIALIZED_LEN + payload_size..);

        match Command::try_from(header.command) {
            Ok(command @ (Command::SearchResponse | Command::Beacon)) => {
                match InboundMessage::decode(command, WireBuf::new(payload, header.byte_order())) {
                    Ok(message) => result.push(message),
                    Err(e) => {
                        debug!("malformed {:?} datagram - dropping the rest: {}", command, e);
                        break;
                    }
                }
            }
            Ok(command) => trace!("ignoring {:?} message in datagram", command),
            Err(_) => trace!("ignoring unknown command {} in datagram", header.command),
        }
    }
    result
}

/// Receives datagrams until the socket fails, passing each relevant message to `handler`
///  together with the datagram's source address.
#[instrument(skip_all, fields(local = ?socket.local_addr().ok()))]
pub async fn receive_loop(socket: Arc<UdpSocket>, handler: impl Fn(InboundMessage, SocketAddr) + Send + 'static) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                // e.g. ICMP port unreachable reported on the next receive
                debug!("error receiving datagram: {}", e);
                continue;
            }
        };
        trace!("received {} bytes from {}", len, from);
        for message in decode_datagram(Bytes::copy_from_slice(&buf[..len])) {
            handler(message, from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::Segment;
    use crate::protocol::messages::{Beacon, SearchResponse, PROTOCOL_TCP};
    use bytes::{BufMut, BytesMut};

    fn message(command: Command, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
        let mut payload = BytesMut::new();
        body(&mut payload);
        let mut result = BytesMut::new();
        MessageHeader::application(command.into(), payload.len() as u32, Segment::Unsegmented).from_server().ser(&mut result);
        result.put_slice(&payload);
        result
    }

    fn search_response() -> SearchResponse {
        SearchResponse {
            guid: [3; 12],
            sequence_id: 9,
            server_addr: unspecified_addr(5075),
            protocol: PROTOCOL_TCP.to_string(),
            found: true,
            cids: vec![1, 2],
        }
    }

    fn beacon() -> Beacon {
        Beacon {
            guid: [4; 12],
            flags: 0,
            sequence: 1,
            change_count: 0,
            server_addr: "10.0.0.1:5075".parse().unwrap(),
            protocol: PROTOCOL_TCP.to_string(),
        }
    }

    #[test]
    fn test_decode_datagram_with_several_messages() {
        let mut datagram = message(Command::SearchResponse, |b| search_response().ser(b));
        datagram.unsplit(message(Command::Echo, |b| b.put_slice(b"xyz")));
        datagram.unsplit(message(Command::Beacon, |b| beacon().ser(b)));

        let messages = decode_datagram(datagram.freeze());
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], InboundMessage::SearchResponse(r) if *r == search_response()));
        assert!(matches!(&messages[1], InboundMessage::Beacon(b) if *b == beacon()));
    }

    #[test]
    fn test_decode_truncated_datagram() {
        let mut datagram = message(Command::SearchResponse, |b| search_response().ser(b));
        let full_len = datagram.len();
        datagram.unsplit(message(Command::Beacon, |b| beacon().ser(b)));
        datagram.truncate(full_len + 12);

        let messages = decode_datagram(datagram.freeze());
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode_datagram(Bytes::from_static(b"definitely not a message")).is_empty());
        assert!(decode_datagram(Bytes::new()).is_empty());
    }

    #[tokio::test]
    async fn test_loopback_search_socket() {
        let client = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let server = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = UdpSocket::local_addr(&server).unwrap();

        SearchSocket::send_search(&client, server_addr, b"hello").await;
        let mut buf = [0u8; 16];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, SearchSocket::local_addr(&client));
    }
}
