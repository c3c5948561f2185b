//! The application facing part of the engine: a [ClientContext] owns all channels, requests,
//!  transports and the search machinery, and routes inbound messages to them.
//!
//! Ids are allocated per context: channel ids (`cid`) for channels and request ids (`ioid`) for
//!  requests. Both are never reused while the owning object is alive.
//!
//! Locks are always taken in the order channel, request, registry, and callbacks into the
//!  application are made without any locks held.

pub mod channel;
pub mod id_table;
pub mod monitor;
pub mod request;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::bail;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::channel::{Channel, ChannelRequester};
use crate::client::id_table::IdTable;
use crate::client::request::Request;
use crate::codec::{FieldRegistry, ValueCodec};
use crate::config::ClientConfig;
use crate::protocol::messages::InboundMessage;
use crate::search::beacon::BeaconHandler;
use crate::search::udp::{bind_beacon_socket, bind_search_socket, receive_loop, SearchSocket};
use crate::search::SearchManager;
use crate::transport::registry::{Connector, TcpConnector, TransportRegistry};
use crate::transport::{ResponseHandler, Transport};

pub const DEFAULT_PRIORITY: i16 = 0;

pub struct ContextInner {
    config: Arc<ClientConfig>,
    channels: Mutex<IdTable<Arc<Channel>>>,
    requests: Mutex<IdTable<Arc<Request>>>,
    search: Arc<SearchManager>,
    transports: Arc<TransportRegistry>,
    beacons: BeaconHandler,
    dispatcher: Arc<Dispatcher>,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ContextInner {
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn search(&self) -> &Arc<SearchManager> {
        &self.search
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    pub(crate) fn dispatcher(&self) -> Arc<dyn ResponseHandler> {
        self.dispatcher.clone()
    }

    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        self.runtime.spawn(future);
    }

    pub fn channel(&self, cid: u32) -> Option<Arc<Channel>> {
        self.channels.lock().get(cid).cloned()
    }

    pub fn request(&self, ioid: u32) -> Option<Arc<Request>> {
        self.requests.lock().get(ioid).cloned()
    }

    pub(crate) fn remove_channel(&self, cid: u32) {
        self.channels.lock().remove(cid);
    }

    pub(crate) fn add_request(&self, create: impl FnOnce(u32) -> Arc<Request>) -> Arc<Request> {
        self.requests.lock().insert_with(create).clone()
    }

    pub(crate) fn remove_request(&self, ioid: u32) {
        self.requests.lock().remove(ioid);
    }

    /// Handles a datagram message received on the search or beacon socket
    pub fn on_udp_message(&self, message: InboundMessage, from: SocketAddr) {
        match message {
            InboundMessage::SearchResponse(response) => self.search.on_search_response(&response, from),
            InboundMessage::Beacon(beacon) => {
                self.beacons.on_beacon(&beacon, from);
            }
            other => debug!("unexpected datagram from {}: {:?} - ignoring", from, other),
        }
    }
}

/// Routes application messages from all transports to channels and requests
struct Dispatcher {
    context: Weak<ContextInner>,
}

impl ResponseHandler for Dispatcher {
    fn handle_message(&self, transport: &Arc<Transport>, registry: &mut dyn FieldRegistry, message: InboundMessage) {
        let Some(context) = self.context.upgrade() else {
            return;
        };

        match message {
            InboundMessage::CreateChannel(response) => match context.channel(response.cid) {
                Some(channel) => channel.create_channel_response(transport, response.sid, response.status),
                None => debug!("create channel response for unknown cid {} - ignoring", response.cid),
            },
            InboundMessage::DestroyChannel(destroyed) => match context.channel(destroyed.cid) {
                Some(channel) => channel.destroyed_by_server(transport),
                None => debug!("destroy channel for unknown cid {} - ignoring", destroyed.cid),
            },
            InboundMessage::Response(response) => match context.request(response.ioid) {
                Some(request) => request.on_response(registry, response.command, response.body),
                None => debug!("{:?} response for unknown ioid {} - ignoring", response.command, response.ioid),
            },
            InboundMessage::Message(message) => match context.request(message.ioid) {
                Some(request) => request.on_server_message(&message),
                None => info!("message from {} for unknown ioid {}: {}", transport.remote_addr(), message.ioid, message.text),
            },
            InboundMessage::Beacon(beacon) => {
                context.beacons.on_beacon(&beacon, transport.remote_addr());
            }
            other => debug!("unhandled message from {}: {:?}", transport.remote_addr(), other),
        }
    }
}

/// Entry point for applications. Dropping the context destroys all channels and closes all
///  connections.
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

impl ClientContext {
    /// Binds the search and beacon sockets and starts searching. Must be called from within a
    ///  tokio runtime.
    pub fn new(config: ClientConfig, codec: Arc<dyn ValueCodec>) -> anyhow::Result<ClientContext> {
        config.validate()?;
        let config = Arc::new(config);

        let search_socket = Arc::new(bind_search_socket()?);
        let connector = Arc::new(TcpConnector::new(config.clone(), codec));
        let context = ClientContext::with_parts(config.clone(), search_socket.clone(), connector)?;
        context.start_search();

        let weak = Arc::downgrade(&context.inner);
        context.spawn_udp_receiver(search_socket, weak.clone());
        match bind_beacon_socket(config.broadcast_port) {
            Ok(beacon_socket) => context.spawn_udp_receiver(Arc::new(beacon_socket), weak),
            Err(e) => warn!("not listening for beacons on port {}: {}", config.broadcast_port, e),
        }

        info!("client context started - searching on {:?}", context.inner.search.destinations());
        Ok(context)
    }

    /// A context with the given search socket and connector, and without any timers or
    ///  receivers running: search buckets are only fired by [ClientContext::start_search] or
    ///  explicitly.
    pub fn with_parts(config: Arc<ClientConfig>, search_socket: Arc<dyn SearchSocket>, connector: Arc<dyn Connector>) -> anyhow::Result<ClientContext> {
        let runtime = Handle::try_current()?;
        let search = Arc::new(SearchManager::new(config.clone(), search_socket));
        let transports = Arc::new(TransportRegistry::new(connector));

        let inner = Arc::new_cyclic(|weak| ContextInner {
            beacons: BeaconHandler::new(search.clone(), transports.clone()),
            dispatcher: Arc::new(Dispatcher { context: weak.clone() }),
            config,
            channels: Mutex::new(IdTable::default()),
            requests: Mutex::new(IdTable::default()),
            search,
            transports,
            runtime,
            tasks: Default::default(),
            shut_down: AtomicBool::new(false),
        });
        Ok(ClientContext { inner })
    }

    /// Starts the search bucket timers
    pub fn start_search(&self) {
        let _runtime = self.inner.runtime.enter();
        let timers = self.inner.search.start();
        self.inner.tasks.lock().extend(timers);
    }

    fn spawn_udp_receiver(&self, socket: Arc<UdpSocket>, context: Weak<ContextInner>) {
        let handle = self.inner.runtime.spawn(receive_loop(socket, move |message, from| {
            if let Some(context) = context.upgrade() {
                context.on_udp_message(message, from);
            }
        }));
        self.inner.tasks.lock().push(handle);
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.inner.config
    }

    pub fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    pub fn search(&self) -> &Arc<SearchManager> {
        &self.inner.search
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.inner.transports
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn request_count(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// Creates a channel that is resolved by search
    pub fn create_channel(&self, name: &str, requester: Arc<dyn ChannelRequester>, priority: i16) -> anyhow::Result<Arc<Channel>> {
        self.create_channel_with_addresses(name, requester, priority, Vec::new())
    }

    /// Creates a channel that connects to the given servers in turn instead of searching. With
    ///  an empty address list, the channel is searched.
    pub fn create_channel_with_addresses(&self, name: &str, requester: Arc<dyn ChannelRequester>, priority: i16, addresses: Vec<SocketAddr>) -> anyhow::Result<Arc<Channel>> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            bail!("client context is shut down");
        }
        if name.is_empty() {
            bail!("channel name must not be empty");
        }

        let context = Arc::downgrade(&self.inner);
        let channel = self.inner.channels.lock()
            .insert_with(|cid| Channel::new(cid, name, priority, addresses, requester, context))
            .clone();
        debug!("created channel {:?} with cid {}", name, channel.cid());

        channel.initiate_search();
        Ok(channel)
    }

    /// Destroys all channels and closes all connections. This is idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down client context");

        let channels = self.inner.channels.lock().take_all();
        for channel in channels {
            channel.destroy(true);
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.transports.close_all();
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
