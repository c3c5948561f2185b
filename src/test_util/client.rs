//! Recording requesters, and builders for the server side of request exchanges

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bit_set::BitSet;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::client::channel::{Channel, ChannelRequester, ConnectionState};
use crate::client::request::{Operation, Request, Requester, ResponseData};
use crate::client::{ClientContext, DEFAULT_PRIORITY};
use crate::codec::{serialize_bitset, FieldDesc, PvValue};
use crate::config::ClientConfig;
use crate::protocol::command::{Command, Qos};
use crate::protocol::header::{ByteOrder, MessageHeader};
use crate::protocol::messages::{CreateChannelResponse, ServerMessage};
use crate::protocol::status::Status;
use crate::protocol::wire::WireBuf;
use crate::search::udp::SearchSocket;
use crate::test_util::codec::TreeValue;
use crate::test_util::transport::CapturingConnector;
use crate::util::buf_ext::BufMutExt;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedData {
    None,
    Value { values: Vec<i32>, changed: Option<BitSet> },
    Length(usize),
    Field(bool),
}

impl RecordedData {
    fn from_response(data: &ResponseData<'_>) -> RecordedData {
        match data {
            ResponseData::None => RecordedData::None,
            ResponseData::Value { value, changed } => RecordedData::Value {
                values: value.as_any().downcast_ref::<TreeValue>()
                    .map(|v| v.values().to_vec())
                    .unwrap_or_default(),
                changed: changed.cloned(),
            },
            ResponseData::Length(length) => RecordedData::Length(*length),
            ResponseData::Field(field) => RecordedData::Field(field.is_some()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    Connected(Status),
    Completed(Operation, Status, RecordedData),
    Monitor,
    Message(String),
    Disconnected,
    Destroyed,
}

type CompletionHook = Box<dyn Fn(&Arc<Request>, Operation) + Send + Sync>;

#[derive(Default)]
pub struct RecordingRequester {
    events: Mutex<Vec<RequestEvent>>,
    on_completed: Mutex<Option<CompletionHook>>,
}

impl RecordingRequester {
    pub fn events(&self) -> Vec<RequestEvent> {
        self.events.lock().clone()
    }

    pub fn take_events(&self) -> Vec<RequestEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// the operations and statuses of all completions so far
    pub fn completions(&self) -> Vec<(Operation, Status)> {
        self.events.lock().iter()
            .filter_map(|e| match e {
                RequestEvent::Completed(operation, status, _) => Some((*operation, status.clone())),
                _ => None,
            })
            .collect()
    }

    /// Registers code to run inside the completion callback, e.g. to start the next operation
    pub fn on_completed(&self, hook: impl Fn(&Arc<Request>, Operation) + Send + Sync + 'static) {
        *self.on_completed.lock() = Some(Box::new(hook));
    }

    fn record(&self, event: RequestEvent) {
        self.events.lock().push(event);
    }
}

impl Requester for RecordingRequester {
    fn request_connected(&self, _request: &Arc<Request>, status: &Status, _field: Option<&Arc<dyn FieldDesc>>) {
        self.record(RequestEvent::Connected(status.clone()));
    }

    fn operation_completed(&self, request: &Arc<Request>, operation: Operation, status: &Status, data: ResponseData<'_>) {
        self.record(RequestEvent::Completed(operation, status.clone(), RecordedData::from_response(&data)));
        if let Some(hook) = self.on_completed.lock().as_ref() {
            hook(request, operation);
        }
    }

    fn monitor_event(&self, _request: &Arc<Request>) {
        self.record(RequestEvent::Monitor);
    }

    fn server_message(&self, _request: &Arc<Request>, message: &ServerMessage) {
        self.record(RequestEvent::Message(message.text.clone()));
    }

    fn channel_disconnected(&self, _request: &Arc<Request>) {
        self.record(RequestEvent::Disconnected);
    }

    fn request_destroyed(&self, _request: &Arc<Request>) {
        self.record(RequestEvent::Destroyed);
    }
}

#[derive(Default)]
pub struct RecordingChannelRequester {
    states: Mutex<Vec<ConnectionState>>,
}

impl RecordingChannelRequester {
    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().clone()
    }
}

impl ChannelRequester for RecordingChannelRequester {
    fn channel_state_change(&self, _channel: &Arc<Channel>, state: ConnectionState) {
        self.states.lock().push(state);
    }
}

/// Keeps all search frames instead of sending them
pub struct RecordingSearchSocket {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
}

impl RecordingSearchSocket {
    pub fn new(local_addr: SocketAddr) -> RecordingSearchSocket {
        RecordingSearchSocket {
            local_addr,
            sent: Default::default(),
        }
    }

    pub fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl SearchSocket for RecordingSearchSocket {
    async fn send_search(&self, to: SocketAddr, frame: &[u8]) {
        self.sent.lock().push((to, Bytes::copy_from_slice(frame)));
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A client context on a [CapturingConnector], with one server at [TestClient::SERVER]
pub struct TestClient {
    pub context: ClientContext,
    pub connector: Arc<CapturingConnector>,
    pub search_socket: Arc<RecordingSearchSocket>,
}

impl TestClient {
    pub const SERVER: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 5075);

    /// server ids are the channel id plus this
    pub const SID_OFFSET: u32 = 1000;

    pub fn new() -> TestClient {
        TestClient::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> TestClient {
        let config = Arc::new(config);
        let connector = Arc::new(CapturingConnector::new(config.clone()));
        let search_socket = Arc::new(RecordingSearchSocket::new(SocketAddr::from(([127, 0, 0, 1], 40000))));
        let context = ClientContext::with_parts(config, search_socket.clone(), connector.clone())
            .expect("test client must be created inside a tokio runtime");
        TestClient {
            context,
            connector,
            search_socket,
        }
    }

    /// lets spawned tasks (connect attempts, timers that are due) run
    pub async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// A channel that is found on [TestClient::SERVER] but not yet created there
    pub async fn found_channel(&self, name: &str) -> (Arc<Channel>, Arc<RecordingChannelRequester>) {
        let requester = Arc::new(RecordingChannelRequester::default());
        let channel = self.context.create_channel(name, requester.clone(), DEFAULT_PRIORITY)
            .expect("channel creation failed");
        assert!(self.context.search().search_response(channel.cid(), 0, Self::SERVER));
        Self::settle().await;
        (channel, requester)
    }

    /// A channel that is connected to [TestClient::SERVER], with the outbound queue drained
    pub async fn connected_channel(&self, name: &str) -> (Arc<Channel>, Arc<RecordingChannelRequester>) {
        let (channel, requester) = self.found_channel(name).await;
        self.connector.take_outbound(Self::SERVER);
        self.create_channel(&channel, Status::ok());
        (channel, requester)
    }

    /// delivers the server's create-channel response
    pub fn create_channel(&self, channel: &Channel, status: Status) {
        let mut buf = BytesMut::new();
        CreateChannelResponse { cid: channel.cid(), sid: channel.cid() + Self::SID_OFFSET, status }.ser(&mut buf);
        self.connector.deliver(Self::SERVER, Command::CreateChannel, buf.freeze());
    }

    /// Outbound application messages as (command, parsed request header, rest of the payload)
    pub fn take_requests(&self) -> Vec<SentRequest> {
        self.connector.take_outbound(Self::SERVER).into_iter()
            .map(|(header, payload)| SentRequest::parse(&header, payload))
            .collect()
    }

    pub fn deliver(&self, command: Command, payload: Bytes) {
        self.connector.deliver(Self::SERVER, command, payload);
    }
}

impl Default for TestClient {
    fn default() -> Self {
        TestClient::new()
    }
}

/// A message sent by the client, with the ids common to all request messages decoded
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub command: u8,
    pub sid: u32,
    pub ioid: u32,
    /// `None` for messages without a QoS byte
    pub qos: Option<Qos>,
    pub body: Bytes,
}

impl SentRequest {
    fn parse(header: &MessageHeader, payload: Bytes) -> SentRequest {
        let mut buf = WireBuf::new(payload.clone(), ByteOrder::BigEndian);
        let sid = buf.try_get_u32().unwrap_or_default();
        let ioid = buf.try_get_u32().unwrap_or_default();
        let has_qos = !matches!(
            Command::try_from(header.command),
            Ok(Command::CreateChannel | Command::DestroyChannel | Command::DestroyRequest | Command::CancelRequest | Command::GetField) | Err(_)
        );
        let qos = if has_qos { buf.try_get_u8().ok().map(Qos::from_bits_retain) } else { None };
        SentRequest {
            command: header.command,
            sid,
            ioid,
            qos,
            body: buf.rest().clone(),
        }
    }

    pub fn is(&self, command: Command) -> bool {
        self.command == u8::from(command)
    }
}

fn response_start(ioid: u32, qos: Qos) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32(ioid);
    buf.put_u8(qos.bits());
    buf
}

/// an init response carrying the given type descriptions
pub fn init_response(ioid: u32, status: &Status, fields: &[Option<&dyn FieldDesc>]) -> Bytes {
    let mut buf = response_start(ioid, Qos::INIT);
    status.ser(&mut buf);
    for field in fields {
        match field {
            Some(field) => field.serialize(&mut buf),
            None => buf.put_null_size(),
        }
    }
    buf.freeze()
}

/// a response with status only, e.g. for put or process
pub fn status_response(ioid: u32, qos: Qos, status: &Status) -> Bytes {
    let mut buf = response_start(ioid, qos);
    status.ser(&mut buf);
    buf.freeze()
}

/// a successful response carrying the changed fields of a value
pub fn value_response(ioid: u32, qos: Qos, value: &dyn PvValue, changed: &BitSet) -> Bytes {
    let mut buf = response_start(ioid, qos);
    Status::ok().ser(&mut buf);
    serialize_bitset(changed, &mut buf);
    value.serialize(&mut buf, Some(changed));
    buf.freeze()
}

pub fn monitor_update(ioid: u32, value: &dyn PvValue, changed: &BitSet, overrun: &BitSet) -> Bytes {
    let mut buf = response_start(ioid, Qos::empty());
    serialize_bitset(changed, &mut buf);
    value.serialize(&mut buf, Some(changed));
    serialize_bitset(overrun, &mut buf);
    buf.freeze()
}
