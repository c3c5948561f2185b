use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::client::request::{Request, RequestKind, Requester};
use crate::client::ContextInner;
use crate::codec::{serialize_full, PvValue};
use crate::protocol::command::Command;
use crate::protocol::messages::{CreateChannelRequest, DestroyChannel};
use crate::protocol::status::Status;
use crate::search::Searchable;
use crate::transport::send_buffer::SendBuffer;
use crate::transport::{Transport, TransportClient, TransportSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NeverConnected,
    Connected,
    Disconnected,
    Destroyed,
}

/// The application side of a channel
pub trait ChannelRequester: Send + Sync {
    /// Called without locks held, once per actual state change
    fn channel_state_change(&self, channel: &Arc<Channel>, state: ConnectionState);
}

struct ChannelInner {
    state: ConnectionState,
    transport: Option<Arc<Transport>>,
    /// the server's id for the channel, assigned by a successful create-channel response
    server_id: Option<u32>,
    requests: BTreeMap<u32, Arc<Request>>,
    /// number of application handles, see [Channel::acquire]
    references: usize,
    /// a create-channel request is in flight on `transport`
    create_pending: bool,
    /// incremented per connect attempt, so that stale timeouts can be recognized
    connect_attempt: u64,
    /// rotation through a static address list
    address_index: usize,
    static_attempts: u32,
}

/// A named remote variable. A channel is resolved by search (or from a static address list),
///  then created on the server over a shared transport. It keeps its requests across
///  reconnects.
pub struct Channel {
    cid: u32,
    name: String,
    priority: i16,
    addresses: Vec<SocketAddr>,
    requester: Arc<dyn ChannelRequester>,
    context: Weak<ContextInner>,
    me: Weak<Channel>,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        cid: u32,
        name: &str,
        priority: i16,
        addresses: Vec<SocketAddr>,
        requester: Arc<dyn ChannelRequester>,
        context: Weak<ContextInner>,
    ) -> Arc<Channel> {
        Arc::new_cyclic(|me| Channel {
            cid,
            name: name.to_string(),
            priority,
            addresses,
            requester,
            context,
            me: me.clone(),
            inner: Mutex::new(ChannelInner {
                state: ConnectionState::NeverConnected,
                transport: None,
                server_id: None,
                requests: BTreeMap::new(),
                references: 1,
                create_pending: false,
                connect_attempt: 0,
                address_index: 0,
                static_attempts: 0,
            }),
        })
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i16 {
        self.priority
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn server_id(&self) -> Option<u32> {
        self.inner.lock().server_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().transport.as_ref().map(|t| t.remote_addr())
    }

    pub fn request_count(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// the transport and server id, only while connected
    pub(crate) fn connection(&self) -> Option<(Arc<Transport>, u32)> {
        let inner = self.inner.lock();
        if inner.state != ConnectionState::Connected {
            return None;
        }
        Some((inner.transport.clone()?, inner.server_id?))
    }

    pub(crate) fn context(&self) -> Option<Arc<ContextInner>> {
        self.context.upgrade()
    }

    /// Adds an application handle to the channel. Every handle must be released by a call to
    ///  [Channel::destroy], and the channel is destroyed when the last one is released.
    pub fn acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Destroyed {
            return false;
        }
        inner.references += 1;
        true
    }

    /// Releases a handle, destroying the channel with the last one, or right away if `force`
    ///  is set. Destroying an already destroyed channel has no effect and returns a
    ///  'channel destroyed' status.
    #[instrument(skip(self), fields(name = %self.name, cid = self.cid))]
    pub fn destroy(&self, force: bool) -> Status {
        let (transport, server_id, requests) = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed {
                return Status::channel_destroyed();
            }
            inner.references = inner.references.saturating_sub(1);
            if inner.references > 0 && !force {
                debug!("channel still has {} references", inner.references);
                return Status::ok();
            }
            inner.references = 0;
            inner.state = ConnectionState::Destroyed;
            inner.create_pending = false;
            (inner.transport.take(), inner.server_id.take(), std::mem::take(&mut inner.requests))
        };
        debug!("destroying channel");

        for request in requests.values() {
            request.destroy_by_channel();
        }

        if let Some(context) = self.context() {
            context.search().unregister(self.cid);
            if let Some(transport) = &transport {
                if let Some(sid) = server_id {
                    transport.enqueue(Arc::new(DestroyChannelSender(DestroyChannel { sid, cid: self.cid })));
                }
                context.transports().release(transport, self.cid);
            }
            context.remove_channel(self.cid);
        }

        self.notify(ConnectionState::Destroyed);
        Status::ok()
    }

    pub fn create_get(&self, requester: Arc<dyn Requester>, pv_request: Option<&dyn PvValue>) -> Result<Arc<Request>, Status> {
        self.create_request(RequestKind::Get, requester, pv_request)
    }

    pub fn create_put(&self, requester: Arc<dyn Requester>, pv_request: Option<&dyn PvValue>) -> Result<Arc<Request>, Status> {
        self.create_request(RequestKind::Put, requester, pv_request)
    }

    pub fn create_put_get(&self, requester: Arc<dyn Requester>, pv_request: Option<&dyn PvValue>) -> Result<Arc<Request>, Status> {
        self.create_request(RequestKind::PutGet, requester, pv_request)
    }

    pub fn create_array(&self, requester: Arc<dyn Requester>, pv_request: Option<&dyn PvValue>) -> Result<Arc<Request>, Status> {
        self.create_request(RequestKind::Array, requester, pv_request)
    }

    pub fn create_process(&self, requester: Arc<dyn Requester>, pv_request: Option<&dyn PvValue>) -> Result<Arc<Request>, Status> {
        self.create_request(RequestKind::Process, requester, pv_request)
    }

    pub fn create_rpc(&self, requester: Arc<dyn Requester>, pv_request: Option<&dyn PvValue>) -> Result<Arc<Request>, Status> {
        self.create_request(RequestKind::Rpc, requester, pv_request)
    }

    /// `queue_size` defaults to the context's configured monitor queue size
    pub fn create_monitor(&self, requester: Arc<dyn Requester>, pv_request: Option<&dyn PvValue>, queue_size: Option<usize>) -> Result<Arc<Request>, Status> {
        self.register_new_request(RequestKind::Monitor, requester, pv_request, String::new(), queue_size)
    }

    /// Asks the server for the type of a (sub) field. This is a one-shot request: it completes
    ///  with [crate::client::request::Operation::GetField] and is destroyed afterwards.
    pub fn get_field(&self, requester: Arc<dyn Requester>, sub_field: &str) -> Result<Arc<Request>, Status> {
        self.register_new_request(RequestKind::GetField, requester, None, sub_field.to_string(), None)
    }

    pub fn create_request(&self, kind: RequestKind, requester: Arc<dyn Requester>, pv_request: Option<&dyn PvValue>) -> Result<Arc<Request>, Status> {
        self.register_new_request(kind, requester, pv_request, String::new(), None)
    }

    fn register_new_request(
        &self,
        kind: RequestKind,
        requester: Arc<dyn Requester>,
        pv_request: Option<&dyn PvValue>,
        sub_field: String,
        queue_size: Option<usize>,
    ) -> Result<Arc<Request>, Status> {
        let Some(context) = self.context() else {
            return Err(Status::channel_destroyed());
        };
        if self.state() == ConnectionState::Destroyed {
            return Err(Status::channel_destroyed());
        }

        let mut serialized = BytesMut::new();
        serialize_full(pv_request, &mut serialized);
        let queue_size = queue_size.unwrap_or(context.config().monitor_queue_size);

        let request = context.add_request(|ioid| Request::new(
            ioid,
            kind,
            self.me.clone(),
            requester,
            serialized.freeze(),
            sub_field,
            queue_size,
        ));

        match self.register_request(&request) {
            Ok(Some(transport)) => request.resubscribe(&transport),
            Ok(None) => trace!("request {} on {:?} waits for the channel to connect", request.ioid(), self.name),
            Err(status) => {
                context.remove_request(request.ioid());
                return Err(status);
            }
        }
        Ok(request)
    }

    /// Adds a request, returning the transport if the channel is created on a server so the
    ///  request can be initialized right away
    fn register_request(&self, request: &Arc<Request>) -> Result<Option<Arc<Transport>>, Status> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Destroyed {
            return Err(Status::channel_destroyed());
        }
        inner.requests.insert(request.ioid(), request.clone());
        match (&inner.transport, inner.server_id) {
            (Some(transport), Some(_)) if inner.state == ConnectionState::Connected => Ok(Some(transport.clone())),
            _ => Ok(None),
        }
    }

    /// Removes a request, returning the connection for sending a destroy message
    pub(crate) fn unregister_request(&self, ioid: u32) -> Option<(Arc<Transport>, u32)> {
        let mut inner = self.inner.lock();
        inner.requests.remove(&ioid)?;
        Some((inner.transport.clone()?, inner.server_id?))
    }

    /// Starts resolving the channel: by search, or by trying the static addresses in turn
    pub(crate) fn initiate_search(&self) {
        let Some(context) = self.context() else {
            return;
        };
        if self.addresses.is_empty() {
            if self.state() == ConnectionState::Destroyed {
                return;
            }
            if let Some(me) = self.me.upgrade() {
                context.search().register(me);
            }
            return;
        }

        let (addr, delay) = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed {
                return;
            }
            let addr = self.addresses[inner.address_index % self.addresses.len()];
            inner.address_index = inner.address_index.wrapping_add(1);
            // a full round through the list without success is followed by a pause
            let delay = if inner.static_attempts > 0 && inner.address_index % self.addresses.len() == 1 % self.addresses.len() {
                context.config().static_address_backoff
            }
            else {
                Duration::ZERO
            };
            inner.static_attempts += 1;
            (addr, delay)
        };
        debug!("connecting channel {:?} to static address {} after {:?}", self.name, addr, delay);

        let me = self.me.clone();
        context.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(channel) = me.upgrade() {
                channel.connect_to(addr).await;
            }
        });
    }

    async fn connect_to(self: Arc<Self>, server_addr: SocketAddr) {
        let Some(context) = self.context() else {
            return;
        };
        if self.state() == ConnectionState::Destroyed {
            return;
        }

        let client: Weak<dyn TransportClient> = self.me.clone();
        let transport = match context.transports().acquire(server_addr, self.priority, context.dispatcher(), self.cid, client).await {
            Ok(transport) => transport,
            Err(e) => {
                debug!("failed to connect channel {:?} to {}: {}", self.name, server_addr, e);
                self.initiate_search();
                return;
            }
        };

        let attempt = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed || inner.transport.is_some() {
                None
            }
            else {
                inner.transport = Some(transport.clone());
                inner.server_id = None;
                inner.create_pending = true;
                inner.connect_attempt += 1;
                Some(inner.connect_attempt)
            }
        };
        let Some(attempt) = attempt else {
            debug!("channel {:?} was destroyed or connected elsewhere meanwhile", self.name);
            context.transports().release(&transport, self.cid);
            return;
        };

        debug!("creating channel {:?} on {}", self.name, server_addr);
        transport.enqueue(Arc::new(CreateChannelSender(CreateChannelRequest {
            cid: self.cid,
            name: self.name.clone(),
        })));

        let me = self.me.clone();
        let timeout = context.config().create_channel_timeout;
        context.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(channel) = me.upgrade() {
                channel.on_create_timeout(attempt);
            }
        });
    }

    fn on_create_timeout(&self, attempt: u64) {
        let timed_out = {
            let inner = self.inner.lock();
            inner.create_pending && inner.connect_attempt == attempt
        };
        if timed_out {
            warn!("no response to creating channel {:?} - searching again", self.name);
            self.connection_lost(true);
        }
    }

    pub(crate) fn create_channel_response(&self, transport: &Arc<Transport>, sid: u32, status: Status) {
        let expected = {
            let inner = self.inner.lock();
            inner.create_pending && inner.transport.as_ref().map(|t| Arc::ptr_eq(t, transport)).unwrap_or(false)
        };
        if !expected {
            debug!("unexpected create channel response for {:?} - ignoring", self.name);
            return;
        }

        if status.is_success() {
            self.connection_completed(transport, sid);
        }
        else {
            warn!("server {} refused to create channel {:?}: {}", transport.remote_addr(), self.name, status);
            self.connection_lost(true);
        }
    }

    /// Re-initializes all requests (in ioid order), then reports the channel connected
    fn connection_completed(&self, transport: &Arc<Transport>, sid: u32) {
        let requests = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed || !inner.transport.as_ref().map(|t| Arc::ptr_eq(t, transport)).unwrap_or(false) {
                return;
            }
            inner.create_pending = false;
            inner.server_id = Some(sid);
            inner.static_attempts = 0;
            inner.requests.values().cloned().collect::<Vec<_>>()
        };

        for request in &requests {
            request.resubscribe(transport);
        }

        let changed = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed {
                return;
            }
            std::mem::replace(&mut inner.state, ConnectionState::Connected) != ConnectionState::Connected
        };
        if changed {
            info!("channel {:?} connected to {}", self.name, transport.remote_addr());
            self.notify(ConnectionState::Connected);
        }
    }

    /// Drops the connection of this channel. With `release`, the transport reference is given
    ///  back (the transport is still alive). The channel is searched again in any case.
    fn connection_lost(&self, release: bool) {
        let (transport, requests, was_connected) = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed {
                return;
            }
            inner.create_pending = false;
            inner.server_id = None;
            let was_connected = inner.state == ConnectionState::Connected;
            if was_connected {
                inner.state = ConnectionState::Disconnected;
            }
            (inner.transport.take(), inner.requests.values().cloned().collect::<Vec<_>>(), was_connected)
        };

        if was_connected {
            for request in &requests {
                request.channel_disconnected();
            }
            self.notify(ConnectionState::Disconnected);
        }
        if release {
            if let (Some(transport), Some(context)) = (transport, self.context()) {
                context.transports().release(&transport, self.cid);
            }
        }
        self.initiate_search();
    }

    /// the server destroyed the channel, but the connection is still fine
    pub(crate) fn destroyed_by_server(&self, transport: &Arc<Transport>) {
        let on_this_transport = self.inner.lock().transport.as_ref()
            .map(|t| Arc::ptr_eq(t, transport))
            .unwrap_or(false);
        if on_this_transport {
            info!("server {} destroyed channel {:?}", transport.remote_addr(), self.name);
            self.connection_lost(true);
        }
    }

    fn notify(&self, state: ConnectionState) {
        if let Some(me) = self.me.upgrade() {
            self.requester.channel_state_change(&me, state);
        }
    }
}

impl Searchable for Channel {
    fn search_id(&self) -> u32 {
        self.cid
    }

    fn search_name(&self) -> &str {
        &self.name
    }

    fn search_response(&self, server_addr: SocketAddr) {
        let (Some(me), Some(context)) = (self.me.upgrade(), self.context()) else {
            return;
        };
        debug!("channel {:?} found on {}", self.name, server_addr);
        context.spawn(me.connect_to(server_addr));
    }
}

impl TransportClient for Channel {
    fn transport_responsive(&self, transport: &Arc<Transport>) {
        let reconnect = {
            let inner = self.inner.lock();
            let same = inner.transport.as_ref().map(|t| Arc::ptr_eq(t, transport)).unwrap_or(false);
            match inner.server_id {
                Some(sid) if same && inner.state == ConnectionState::Disconnected => Some(sid),
                _ => None,
            }
        };
        if let Some(sid) = reconnect {
            debug!("connection of channel {:?} is responsive again", self.name);
            self.connection_completed(transport, sid);
        }
    }

    fn transport_unresponsive(&self) {
        let requests = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.requests.values().cloned().collect::<Vec<_>>()
        };
        for request in &requests {
            request.channel_disconnected();
        }
        self.notify(ConnectionState::Disconnected);
    }

    fn transport_changed(&self) {
        // the server may have lost its state, so a disconnected channel is created again
        if self.state() == ConnectionState::Disconnected {
            self.connection_lost(true);
        }
    }

    fn transport_closed(&self) {
        self.connection_lost(false);
    }
}

pub struct CreateChannelSender(pub CreateChannelRequest);
impl TransportSender for CreateChannelSender {
    fn send(&self, buffer: &mut SendBuffer, _transport: &Transport) -> anyhow::Result<()> {
        buffer.start_message(Command::CreateChannel, self.0.serialized_len());
        self.0.ser(buffer);
        buffer.end_message();
        Ok(())
    }
}

pub struct DestroyChannelSender(pub DestroyChannel);
impl TransportSender for DestroyChannelSender {
    fn send(&self, buffer: &mut SendBuffer, _transport: &Transport) -> anyhow::Result<()> {
        buffer.start_message(Command::DestroyChannel, DestroyChannel::SERIALIZED_LEN);
        self.0.ser(buffer);
        buffer.end_message();
        Ok(())
    }
}
