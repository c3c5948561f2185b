//! A transport is one TCP connection to one server, shared by all channels on that server.
//!
//! Only the transport's send worker writes to the socket. Everybody else hands a
//!  [TransportSender] to [Transport::enqueue], and the send worker calls it when it is the
//!  sender's turn, passing the outbound buffer. This keeps frames from different channels and
//!  requests from interleaving, and it means that enqueueing never blocks.
//!
//! Only the receive worker reads from the socket. It handles connection-level messages
//!  (flow control, validation, echo) itself and passes everything else to a [ResponseHandler]
//!  synchronously.

pub mod connection;
pub mod flow_control;
pub mod frame_decoder;
pub mod registry;
pub mod send_buffer;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BufMut;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::codec::FieldRegistry;
use crate::config::ClientConfig;
use crate::protocol::command::{Command, ControlCommand};
use crate::protocol::header::PROTOCOL_REVISION;
use crate::protocol::messages::{ConnectionValidationResponse, InboundMessage};
use crate::transport::flow_control::FlowControl;
use crate::transport::send_buffer::SendBuffer;

/// Something that wants to write to the connection. It is called by the send worker when it is
///  its turn, and it writes zero or more complete messages into the buffer.
///
/// A sender can be enqueued several times. It is responsible for not writing the same data
///  twice, typically by keeping track of what it has already written.
pub trait TransportSender: Send + Sync {
    fn send(&self, buffer: &mut SendBuffer, transport: &Transport) -> anyhow::Result<()>;
}

/// A user of the transport (i.e. a channel) that is notified of lifecycle changes
pub trait TransportClient: Send + Sync {
    /// The transport is verified, or it became responsive again after being unresponsive
    fn transport_responsive(&self, transport: &Arc<Transport>);
    fn transport_unresponsive(&self);
    /// The server may have lost state, e.g. after a restart that kept the connection
    fn transport_changed(&self);
    fn transport_closed(&self);
}

/// Receives all application messages that are not handled by the transport itself.
pub trait ResponseHandler: Send + Sync {
    fn handle_message(&self, transport: &Arc<Transport>, registry: &mut dyn FieldRegistry, message: InboundMessage);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPhase {
    /// connected, waiting for the validation handshake to complete
    Validating,
    Verified,
    Closed,
}

struct Liveness {
    last_receive: Instant,
    last_echo: Instant,
    responsive: bool,
}

pub struct Transport {
    remote_addr: SocketAddr,
    priority: i16,
    config: Arc<ClientConfig>,
    handler: Arc<dyn ResponseHandler>,

    sender_queue: mpsc::UnboundedSender<Arc<dyn TransportSender>>,
    phase: watch::Sender<TransportPhase>,
    revision: AtomicU8,
    flow: FlowControl,

    /// registered clients by channel id - this doubles as the transport's reference count
    clients: Mutex<BTreeMap<u32, Weak<dyn TransportClient>>>,
    liveness: Mutex<Liveness>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Creates a transport without any I/O attached. The caller is responsible for draining the
    ///  returned queue, typically by spawning the workers in [connection].
    pub fn new(remote_addr: SocketAddr, priority: i16, config: Arc<ClientConfig>, handler: Arc<dyn ResponseHandler>) -> (Arc<Transport>, mpsc::UnboundedReceiver<Arc<dyn TransportSender>>) {
        let (sender_queue, receiver) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(TransportPhase::Validating);
        let now = Instant::now();

        let transport = Transport {
            remote_addr,
            priority,
            config,
            handler,
            sender_queue,
            phase,
            revision: AtomicU8::new(PROTOCOL_REVISION),
            flow: FlowControl::default(),
            clients: Default::default(),
            liveness: Mutex::new(Liveness {
                last_receive: now,
                last_echo: now,
                responsive: true,
            }),
            workers: Default::default(),
        };
        (Arc::new(transport), receiver)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn priority(&self) -> i16 {
        self.priority
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// the protocol revision used on this connection: the minimum of ours and the peer's
    pub fn revision(&self) -> u8 {
        self.revision.load(Ordering::Acquire)
    }

    pub(crate) fn on_peer_revision(&self, peer_revision: u8) {
        self.revision.fetch_min(peer_revision, Ordering::AcqRel);
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn unacknowledged_bytes(&self) -> u64 {
        self.flow.unacknowledged_bytes()
    }

    pub fn phase(&self) -> TransportPhase {
        *self.phase.borrow()
    }

    pub fn is_verified(&self) -> bool {
        self.phase() == TransportPhase::Verified
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == TransportPhase::Closed
    }

    pub(crate) fn subscribe_phase(&self) -> watch::Receiver<TransportPhase> {
        self.phase.subscribe()
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ResponseHandler> {
        &self.handler
    }

    pub(crate) fn add_workers(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.workers.lock().extend(handles);
    }

    /// Adds a sender to the outbound queue. This never blocks. Senders enqueued on a closed
    ///  transport are discarded.
    pub fn enqueue(&self, sender: Arc<dyn TransportSender>) {
        if self.is_closed() {
            debug!("transport to {} is closed - discarding sender", self.remote_addr);
            return;
        }
        if self.sender_queue.send(sender).is_err() {
            debug!("send worker for {} terminated - discarding sender", self.remote_addr);
        }
    }

    /// Registers a client (i.e. a channel). Fails if the transport is closed.
    pub fn register_client(&self, cid: u32, client: Weak<dyn TransportClient>) -> anyhow::Result<()> {
        let mut clients = self.clients.lock();
        if self.is_closed() {
            anyhow::bail!("transport to {} is closed", self.remote_addr);
        }
        clients.insert(cid, client);
        Ok(())
    }

    /// Returns the number of clients that remain registered
    pub fn unregister_client(&self, cid: u32) -> usize {
        let mut clients = self.clients.lock();
        clients.remove(&cid);
        clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    fn live_clients(&self) -> Vec<Arc<dyn TransportClient>> {
        self.clients.lock().values()
            .filter_map(|c| c.upgrade())
            .collect()
    }

    /// Completes the validation handshake. Clients registered at this point are notified as
    ///  responsive.
    pub(crate) fn verified(self: &Arc<Self>) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == TransportPhase::Validating {
                *phase = TransportPhase::Verified;
                true
            }
            else {
                false
            }
        });
        if changed {
            info!("connection to {} verified, protocol revision {}", self.remote_addr, self.revision());
            for client in self.live_clients() {
                client.transport_responsive(self);
            }
        }
    }

    /// Waits for the validation handshake, returning `false` if the transport was closed instead
    pub async fn wait_verified(&self) -> bool {
        let mut phase = self.phase.subscribe();
        let result = phase.wait_for(|p| *p != TransportPhase::Validating).await
            .map(|p| *p == TransportPhase::Verified);
        result.unwrap_or(false)
    }

    /// Called for every received chunk of data, and for beacons from the transport's peer
    pub fn alive_notification(self: &Arc<Self>) {
        let became_responsive = {
            let mut liveness = self.liveness.lock();
            liveness.last_receive = Instant::now();
            !std::mem::replace(&mut liveness.responsive, true)
        };
        if became_responsive {
            self.responsive();
        }
    }

    pub fn idle_time(&self) -> Duration {
        self.liveness.lock().last_receive.elapsed()
    }

    /// Notifies all clients that the transport is responsive (again)
    pub fn responsive(self: &Arc<Self>) {
        if !self.is_verified() {
            return;
        }
        debug!("connection to {} is responsive", self.remote_addr);
        for client in self.live_clients() {
            client.transport_responsive(self);
        }
    }

    /// Notifies all clients that the transport is unresponsive. This happens only once until the
    ///  transport becomes responsive again.
    pub fn unresponsive(&self) {
        let was_responsive = std::mem::replace(&mut self.liveness.lock().responsive, false);
        if !was_responsive {
            return;
        }
        info!("connection to {} is unresponsive", self.remote_addr);
        for client in self.live_clients() {
            client.transport_unresponsive();
        }
    }

    pub fn changed_transport(&self) {
        debug!("connection to {} changed", self.remote_addr);
        for client in self.live_clients() {
            client.transport_changed();
        }
    }

    /// Closes the transport. This is idempotent: only the first call notifies clients.
    pub fn close(&self) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase != TransportPhase::Closed {
                *phase = TransportPhase::Closed;
                true
            }
            else {
                false
            }
        });
        if !changed {
            return;
        }
        info!("closing connection to {}", self.remote_addr);
        self.closed();

        // workers stop at their next await point, which may be right away for the caller's own task
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }

    /// Notifies and unregisters all clients
    pub fn closed(&self) {
        let clients = std::mem::take(&mut *self.clients.lock());
        for client in clients.values().filter_map(|c| c.upgrade()) {
            client.transport_closed();
        }
    }

    /// Called periodically by the liveness worker: sends an echo when the connection was idle
    ///  for the echo period, and reports unresponsiveness after the connection timeout.
    pub(crate) fn check_liveness(&self) {
        let (idle, echo_due) = {
            let mut liveness = self.liveness.lock();
            let idle = liveness.last_receive.elapsed();
            let echo_due = idle >= self.config.echo_period && liveness.last_echo.elapsed() >= self.config.echo_period;
            if echo_due {
                liveness.last_echo = Instant::now();
            }
            (idle, echo_due)
        };

        if echo_due {
            trace!("connection to {} idle for {:?} - sending echo", self.remote_addr, idle);
            self.enqueue(Arc::new(EchoSender));
        }
        if idle >= self.config.connection_timeout {
            self.unresponsive();
        }
    }
}

/// a control message, e.g. a marker acknowledgement
pub struct ControlSender {
    pub command: ControlCommand,
    pub value: u32,
}
impl TransportSender for ControlSender {
    fn send(&self, buffer: &mut SendBuffer, _transport: &Transport) -> anyhow::Result<()> {
        buffer.put_control(self.command, self.value);
        Ok(())
    }
}

/// an application level echo with empty payload
pub struct EchoSender;
impl TransportSender for EchoSender {
    fn send(&self, buffer: &mut SendBuffer, _transport: &Transport) -> anyhow::Result<()> {
        buffer.start_message(Command::Echo, 0);
        buffer.end_message();
        Ok(())
    }
}

pub struct ValidationSender(pub ConnectionValidationResponse);
impl TransportSender for ValidationSender {
    fn send(&self, buffer: &mut SendBuffer, _transport: &Transport) -> anyhow::Result<()> {
        buffer.start_message(Command::ConnectionValidation, self.0.serialized_len());
        self.0.ser(buffer);
        buffer.end_message();
        Ok(())
    }
}

/// a pre-serialized payload, mainly for tests and tools
pub struct RawSender {
    pub command: Command,
    pub payload: bytes::Bytes,
}
impl TransportSender for RawSender {
    fn send(&self, buffer: &mut SendBuffer, _transport: &Transport) -> anyhow::Result<()> {
        buffer.start_message(self.command, self.payload.len());
        buffer.put_slice(&self.payload);
        buffer.end_message();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::transport::{drain_messages, RecordingHandler};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub(crate) struct CountingClient {
        pub responsive: AtomicUsize,
        pub unresponsive: AtomicUsize,
        pub changed: AtomicUsize,
        pub closed: AtomicUsize,
    }
    impl TransportClient for CountingClient {
        fn transport_responsive(&self, _transport: &Arc<Transport>) {
            self.responsive.fetch_add(1, Ordering::SeqCst);
        }
        fn transport_unresponsive(&self) {
            self.unresponsive.fetch_add(1, Ordering::SeqCst);
        }
        fn transport_changed(&self) {
            self.changed.fetch_add(1, Ordering::SeqCst);
        }
        fn transport_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn new_transport() -> (Arc<Transport>, mpsc::UnboundedReceiver<Arc<dyn TransportSender>>) {
        Transport::new("127.0.0.1:5075".parse().unwrap(), 0, Arc::new(ClientConfig::default()), Arc::new(RecordingHandler::default()))
    }

    #[tokio::test]
    async fn test_enqueue_fifo() {
        let (transport, mut rx) = new_transport();
        transport.enqueue(Arc::new(RawSender { command: Command::Get, payload: bytes::Bytes::from_static(b"1") }));
        transport.enqueue(Arc::new(RawSender { command: Command::Put, payload: bytes::Bytes::from_static(b"2") }));

        let messages = drain_messages(&transport, &mut rx);
        assert_eq!(messages.iter().map(|(h, _)| h.command).collect::<Vec<_>>(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_discarded() {
        let (transport, mut rx) = new_transport();
        transport.close();
        transport.enqueue(Arc::new(EchoSender));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_notifications() {
        let (transport, _rx) = new_transport();
        let client = Arc::new(CountingClient::default());
        let weak: Weak<dyn TransportClient> = Arc::downgrade(&client) as Weak<dyn TransportClient>;
        transport.register_client(1, weak).unwrap();

        transport.verified();
        assert!(transport.is_verified());
        assert_eq!(client.responsive.load(Ordering::SeqCst), 1);

        transport.unresponsive();
        transport.unresponsive();
        assert_eq!(client.unresponsive.load(Ordering::SeqCst), 1);

        transport.alive_notification();
        assert_eq!(client.responsive.load(Ordering::SeqCst), 2);

        transport.changed_transport();
        assert_eq!(client.changed.load(Ordering::SeqCst), 1);

        transport.close();
        transport.close();
        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
        assert_eq!(transport.client_count(), 0);
        assert!(transport.register_client(2, Arc::downgrade(&client) as Weak<dyn TransportClient>).is_err());
    }

    #[tokio::test]
    async fn test_wait_verified() {
        let (transport, _rx) = new_transport();
        let t2 = transport.clone();
        let handle = tokio::spawn(async move { t2.wait_verified().await });
        tokio::task::yield_now().await;
        transport.verified();
        assert!(handle.await.unwrap());

        let (transport, _rx) = new_transport();
        transport.close();
        assert!(!transport.wait_verified().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness() {
        let (transport, mut rx) = new_transport();
        transport.verified();
        let client = Arc::new(CountingClient::default());
        transport.register_client(1, Arc::downgrade(&client) as Weak<dyn TransportClient>).unwrap();

        tokio::time::advance(transport.config().echo_period).await;
        transport.check_liveness();
        transport.check_liveness();
        let messages = drain_messages(&transport, &mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0.command, u8::from(Command::Echo));
        assert_eq!(client.unresponsive.load(Ordering::SeqCst), 0);

        tokio::time::advance(transport.config().connection_timeout).await;
        transport.check_liveness();
        assert_eq!(client.unresponsive.load(Ordering::SeqCst), 1);

        transport.alive_notification();
        assert_eq!(client.responsive.load(Ordering::SeqCst), 1);
        assert!(transport.idle_time() < Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_revision_negotiation() {
        let (transport, _rx) = new_transport();
        assert_eq!(transport.revision(), PROTOCOL_REVISION);
        transport.on_peer_revision(5);
        assert_eq!(transport.revision(), PROTOCOL_REVISION);
        transport.on_peer_revision(1);
        assert_eq!(transport.revision(), 1);
    }
}
