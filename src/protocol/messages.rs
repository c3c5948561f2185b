//! Typed forms of the messages that are handled by the engine itself. Request / response bodies
//!  (get, put, monitor etc.) are only split into their id and the rest here - their content
//!  depends on the request's state and is decoded there.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::command::Command;
use crate::protocol::header::{MessageHeader, Segment};
use crate::protocol::status::Status;
use crate::protocol::wire::WireBuf;
use crate::util::buf_ext::{BufMutExt, LONG_SIZE};
use crate::util::safe_converter::PrecheckedCast;

pub const PROTOCOL_TCP: &str = "tcp";
pub const AUTH_ANONYMOUS: &str = "anonymous";

pub type Guid = [u8; 12];

/// number of bytes a size takes on the wire
pub fn size_len(size: usize) -> usize {
    if size < LONG_SIZE as usize { 1 } else { 5 }
}

pub fn string_len(s: &str) -> usize {
    size_len(s.len()) + s.len()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchFlags(u8);
impl SearchFlags {
    pub const REPLY_REQUIRED: u8 = 0x01;
    pub const UNICAST: u8 = 0x80;

    pub fn new(reply_required: bool, unicast: bool) -> SearchFlags {
        let mut bits = 0;
        if reply_required { bits |= Self::REPLY_REQUIRED; }
        if unicast { bits |= Self::UNICAST; }
        SearchFlags(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
    pub fn reply_required(&self) -> bool {
        self.0 & Self::REPLY_REQUIRED != 0
    }
    pub fn unicast(&self) -> bool {
        self.0 & Self::UNICAST != 0
    }
}

/// Incrementally builds one search datagram (header included), adding channel entries until
///  either the entry cap or the datagram size limit is reached.
pub struct SearchFrame {
    buf: BytesMut,
    count_pos: usize,
    count: usize,
    max_len: usize,
    max_entries: usize,
}

impl SearchFrame {
    pub fn new(sequence_id: u32, response_addr: SocketAddr, flags: SearchFlags, max_len: usize, max_entries: usize) -> SearchFrame {
        let mut buf = BytesMut::with_capacity(max_len);
        MessageHeader::application(Command::Search.into(), 0, Segment::Unsegmented).ser(&mut buf);
        buf.put_u32(sequence_id);
        buf.put_u8(flags.bits());
        buf.put_slice(&[0, 0, 0]);
        buf.put_socket_addr(&response_addr);
        buf.put_size(1);
        buf.put_string(PROTOCOL_TCP);
        let count_pos = buf.len();
        buf.put_u16(0);

        SearchFrame {
            buf,
            count_pos,
            count: 0,
            max_len,
            max_entries,
        }
    }

    /// Returns `false` if the entry does not fit. The first entry is always accepted so that
    ///  a long channel name can not block searching.
    pub fn try_add(&mut self, cid: u32, name: &str) -> bool {
        let entry_len = size_of::<u32>() + string_len(name);
        if self.count > 0 && (self.count >= self.max_entries || self.buf.len() + entry_len > self.max_len) {
            return false;
        }
        self.buf.put_u32(cid);
        self.buf.put_string(name);
        self.count += 1;
        true
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(mut self) -> Bytes {
        let count: u16 = self.count.prechecked_cast();
        self.buf[self.count_pos..self.count_pos + 2].copy_from_slice(&count.to_be_bytes());

        let payload_size: u32 = (self.buf.len() - MessageHeader::SERIALIZED_LEN).prechecked_cast();
        self.buf[4..8].copy_from_slice(&payload_size.to_be_bytes());
        self.buf.freeze()
    }
}

/// The decoded form of a search request, as seen by a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub sequence_id: u32,
    pub flags: SearchFlags,
    pub response_addr: SocketAddr,
    pub protocols: Vec<String>,
    pub channels: Vec<(u32, String)>,
}
impl SearchRequest {
    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<SearchRequest> {
        let sequence_id = buf.try_get_u32()?;
        let flags = SearchFlags(buf.try_get_u8()?);
        buf.skip(3)?;
        let response_addr = buf.try_get_socket_addr()?;
        let num_protocols = buf.try_get_size()?.unwrap_or(0);
        let mut protocols = Vec::with_capacity(num_protocols.min(8));
        for _ in 0..num_protocols {
            protocols.push(buf.try_get_string()?);
        }
        let num_channels = buf.try_get_u16()?;
        let mut channels = Vec::with_capacity(num_channels as usize);
        for _ in 0..num_channels {
            let cid = buf.try_get_u32()?;
            channels.push((cid, buf.try_get_string()?));
        }
        Ok(SearchRequest {
            sequence_id,
            flags,
            response_addr,
            protocols,
            channels,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub guid: Guid,
    pub sequence_id: u32,
    /// an unspecified address means 'the address this datagram was sent from'
    pub server_addr: SocketAddr,
    pub protocol: String,
    pub found: bool,
    pub cids: Vec<u32>,
}
impl SearchResponse {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.guid);
        buf.put_u32(self.sequence_id);
        buf.put_socket_addr(&self.server_addr);
        buf.put_string(&self.protocol);
        buf.put_u8(self.found as u8);
        buf.put_u16(self.cids.len().prechecked_cast());
        for cid in &self.cids {
            buf.put_u32(*cid);
        }
    }

    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<SearchResponse> {
        let guid = buf.try_get_array::<12>()?;
        let sequence_id = buf.try_get_u32()?;
        let server_addr = buf.try_get_socket_addr()?;
        let protocol = buf.try_get_string()?;
        let found = buf.try_get_u8()? != 0;
        let count = buf.try_get_u16()?;
        let mut cids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cids.push(buf.try_get_u32()?);
        }
        Ok(SearchResponse {
            guid,
            sequence_id,
            server_addr,
            protocol,
            found,
            cids,
        })
    }

    /// The server's TCP address, taking the IP address from the datagram's source if the
    ///  server did not specify one
    pub fn resolved_server_addr(&self, from: SocketAddr) -> SocketAddr {
        resolve_unspecified(self.server_addr, from)
    }
}

fn resolve_unspecified(addr: SocketAddr, from: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(from.ip(), addr.port())
    }
    else {
        addr
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub guid: Guid,
    pub flags: u8,
    pub sequence: u8,
    pub change_count: u16,
    pub server_addr: SocketAddr,
    pub protocol: String,
}
impl Beacon {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.guid);
        buf.put_u8(self.flags);
        buf.put_u8(self.sequence);
        buf.put_u16(self.change_count);
        buf.put_socket_addr(&self.server_addr);
        buf.put_string(&self.protocol);
        buf.put_null_size();
    }

    /// The optional trailing server status is not interpreted
    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<Beacon> {
        Ok(Beacon {
            guid: buf.try_get_array::<12>()?,
            flags: buf.try_get_u8()?,
            sequence: buf.try_get_u8()?,
            change_count: buf.try_get_u16()?,
            server_addr: buf.try_get_socket_addr()?,
            protocol: buf.try_get_string()?,
        })
    }

    pub fn resolved_server_addr(&self, from: SocketAddr) -> SocketAddr {
        resolve_unspecified(self.server_addr, from)
    }
}

/// sent by the server as the first message on a new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionValidationRequest {
    pub receive_buffer_size: u32,
    pub registry_size: u16,
    pub auth_plugins: Vec<String>,
}
impl ConnectionValidationRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.receive_buffer_size);
        buf.put_u16(self.registry_size);
        buf.put_size(self.auth_plugins.len());
        for plugin in &self.auth_plugins {
            buf.put_string(plugin);
        }
    }

    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<ConnectionValidationRequest> {
        let receive_buffer_size = buf.try_get_u32()?;
        let registry_size = buf.try_get_u16()?;
        let num_plugins = buf.try_get_size()?.unwrap_or(0);
        let mut auth_plugins = Vec::with_capacity(num_plugins.min(8));
        for _ in 0..num_plugins {
            auth_plugins.push(buf.try_get_string()?);
        }
        Ok(ConnectionValidationRequest {
            receive_buffer_size,
            registry_size,
            auth_plugins,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionValidationResponse {
    pub receive_buffer_size: u32,
    pub registry_size: u16,
    pub priority: i16,
    pub auth_plugin: String,
}
impl ConnectionValidationResponse {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.receive_buffer_size);
        buf.put_u16(self.registry_size);
        buf.put_i16(self.priority);
        buf.put_string(&self.auth_plugin);
        buf.put_null_size();
    }

    pub fn serialized_len(&self) -> usize {
        4 + 2 + 2 + string_len(&self.auth_plugin) + 1
    }

    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<ConnectionValidationResponse> {
        let result = ConnectionValidationResponse {
            receive_buffer_size: buf.try_get_u32()?,
            registry_size: buf.try_get_u16()?,
            priority: buf.try_get_i16()?,
            auth_plugin: buf.try_get_string()?,
        };
        // authentication data is not interpreted
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelRequest {
    pub cid: u32,
    pub name: String,
}
impl CreateChannelRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(1);
        buf.put_u32(self.cid);
        buf.put_string(&self.name);
    }

    pub fn serialized_len(&self) -> usize {
        2 + 4 + string_len(&self.name)
    }

    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<CreateChannelRequest> {
        let count = buf.try_get_u16()?;
        if count != 1 {
            bail!("create channel request for {} channels is not supported", count);
        }
        Ok(CreateChannelRequest {
            cid: buf.try_get_u32()?,
            name: buf.try_get_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelResponse {
    pub cid: u32,
    pub sid: u32,
    pub status: Status,
}
impl CreateChannelResponse {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.cid);
        buf.put_u32(self.sid);
        self.status.ser(buf);
    }

    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<CreateChannelResponse> {
        Ok(CreateChannelResponse {
            cid: buf.try_get_u32()?,
            sid: buf.try_get_u32()?,
            status: Status::deser(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyChannel {
    pub sid: u32,
    pub cid: u32,
}
impl DestroyChannel {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sid);
        buf.put_u32(self.cid);
    }

    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<DestroyChannel> {
        Ok(DestroyChannel {
            sid: buf.try_get_u32()?,
            cid: buf.try_get_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
    Fatal,
}
impl MessageSeverity {
    fn from_wire(raw: u8) -> MessageSeverity {
        match raw {
            0 => MessageSeverity::Info,
            1 => MessageSeverity::Warning,
            2 => MessageSeverity::Error,
            _ => MessageSeverity::Fatal,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            MessageSeverity::Info => 0,
            MessageSeverity::Warning => 1,
            MessageSeverity::Error => 2,
            MessageSeverity::Fatal => 3,
        }
    }
}

/// a free-text message from the server concerning a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub ioid: u32,
    pub severity: MessageSeverity,
    pub text: String,
}
impl ServerMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ioid);
        buf.put_u8(self.severity.to_wire());
        buf.put_string(&self.text);
    }

    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<ServerMessage> {
        Ok(ServerMessage {
            ioid: buf.try_get_u32()?,
            severity: MessageSeverity::from_wire(buf.try_get_u8()?),
            text: buf.try_get_string()?,
        })
    }
}

/// The response to a request: the request id is decoded (after the channel id for a server side
///  destroy), the body is left for the request
#[derive(Debug, Clone)]
pub struct RequestResponse {
    pub command: Command,
    pub ioid: u32,
    pub body: WireBuf,
}

/// Every application message a client can receive, decoded as far as it is independent of
///  per-request state.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Beacon(Beacon),
    ConnectionValidation(ConnectionValidationRequest),
    ConnectionValidated(Status),
    Echo(Bytes),
    SearchResponse(SearchResponse),
    CreateChannel(CreateChannelResponse),
    DestroyChannel(DestroyChannel),
    Response(RequestResponse),
    Message(ServerMessage),
    /// valid commands that a client does not act on
    Ignored(Command),
}

impl InboundMessage {
    pub fn decode(command: Command, mut payload: WireBuf) -> anyhow::Result<InboundMessage> {
        use InboundMessage as M;

        Ok(match command {
            Command::Beacon => M::Beacon(Beacon::deser(&mut payload)?),
            Command::ConnectionValidation => M::ConnectionValidation(ConnectionValidationRequest::deser(&mut payload)?),
            Command::ConnectionValidated => M::ConnectionValidated(Status::deser(&mut payload)?),
            Command::Echo => M::Echo(payload.rest().clone()),
            Command::SearchResponse => M::SearchResponse(SearchResponse::deser(&mut payload)?),
            Command::CreateChannel => M::CreateChannel(CreateChannelResponse::deser(&mut payload)?),
            Command::DestroyChannel => M::DestroyChannel(DestroyChannel::deser(&mut payload)?),
            Command::Get |
            Command::Put |
            Command::PutGet |
            Command::Monitor |
            Command::Array |
            Command::Process |
            Command::GetField |
            Command::Rpc => {
                let ioid = payload.try_get_u32()?;
                M::Response(RequestResponse { command, ioid, body: payload })
            }
            Command::DestroyRequest => {
                let _sid = payload.try_get_u32()?;
                let ioid = payload.try_get_u32()?;
                M::Response(RequestResponse { command, ioid, body: payload })
            }
            Command::Message => M::Message(ServerMessage::deser(&mut payload)?),
            Command::Search |
            Command::AuthNz |
            Command::AclChange |
            Command::MultipleData |
            Command::CancelRequest |
            Command::OriginTag => M::Ignored(command),
        })
    }
}

/// an unspecified IPv6 address, telling the peer to use the datagram's source address
pub fn unspecified_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
}
