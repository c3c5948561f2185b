//! Transports without sockets: the outbound queue is drained by the test instead of a send
//!  worker, and inbound messages are injected directly into the response handler.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec::FieldRegistry;
use crate::config::ClientConfig;
use crate::protocol::command::Command;
use crate::protocol::header::{ByteOrder, MessageHeader};
use crate::protocol::messages::InboundMessage;
use crate::protocol::wire::WireBuf;
use crate::test_util::codec::TreeRegistry;
use crate::transport::frame_decoder::{Frame, FrameDecoder};
use crate::transport::registry::Connector;
use crate::transport::send_buffer::SendBuffer;
use crate::transport::{ResponseHandler, Transport, TransportSender};

/// Collects everything it is asked to handle
#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<InboundMessage>>,
}

impl RecordingHandler {
    pub fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().clone()
    }
}

impl ResponseHandler for RecordingHandler {
    fn handle_message(&self, _transport: &Arc<Transport>, _registry: &mut dyn FieldRegistry, message: InboundMessage) {
        self.messages.lock().push(message);
    }
}

/// Runs all queued senders the way the send worker would, and decodes the result
pub fn drain_frames(transport: &Transport, senders: &mut mpsc::UnboundedReceiver<Arc<dyn TransportSender>>) -> Vec<Frame> {
    let config = transport.config();
    let mut buffer = SendBuffer::new(config.send_buffer_size, config.marker_period_bytes);
    while let Ok(sender) = senders.try_recv() {
        if sender.send(&mut buffer, transport).is_err() {
            buffer.abandon_message();
        }
    }

    let mut src = BytesMut::new();
    for fill in buffer.flush() {
        src.extend_from_slice(&fill);
    }
    let mut decoder = FrameDecoder::new(config.max_message_size);
    let mut result = Vec::new();
    while let Ok(Some(frame)) = decoder.decode(&mut src) {
        result.push(frame);
    }
    result
}

/// application messages only
pub fn drain_messages(transport: &Transport, senders: &mut mpsc::UnboundedReceiver<Arc<dyn TransportSender>>) -> Vec<(MessageHeader, Bytes)> {
    drain_frames(transport, senders).into_iter()
        .filter_map(|frame| match frame {
            Frame::Application(header, payload) => Some((header, payload)),
            Frame::Control(_) => None,
        })
        .collect()
}

struct CapturedConnection {
    transport: Arc<Transport>,
    handler: Arc<dyn ResponseHandler>,
    senders: mpsc::UnboundedReceiver<Arc<dyn TransportSender>>,
}

/// A [Connector] that creates verified transports without any I/O and keeps them accessible
///  for the test: outbound messages can be inspected, and server messages injected.
pub struct CapturingConnector {
    config: Arc<ClientConfig>,
    connections: Mutex<Vec<CapturedConnection>>,
    refuse: AtomicBool,
}

impl CapturingConnector {
    pub fn new(config: Arc<ClientConfig>) -> CapturingConnector {
        CapturingConnector {
            config,
            connections: Default::default(),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// the most recent transport to a server
    pub fn transport(&self, remote_addr: SocketAddr) -> Option<Arc<Transport>> {
        self.connections.lock().iter().rev()
            .find(|c| c.transport.remote_addr() == remote_addr)
            .map(|c| c.transport.clone())
    }

    /// Everything that was sent on the most recent transport to a server since the last call
    pub fn take_outbound(&self, remote_addr: SocketAddr) -> Vec<(MessageHeader, Bytes)> {
        let mut connections = self.connections.lock();
        match connections.iter_mut().rev().find(|c| c.transport.remote_addr() == remote_addr) {
            Some(c) => drain_messages(&c.transport, &mut c.senders),
            None => Vec::new(),
        }
    }

    /// Passes a message to the client as if it had been received from the server
    pub fn deliver(&self, remote_addr: SocketAddr, command: Command, payload: Bytes) {
        let target = self.connections.lock().iter().rev()
            .find(|c| c.transport.remote_addr() == remote_addr)
            .map(|c| (c.transport.clone(), c.handler.clone()));
        let Some((transport, handler)) = target else {
            panic!("no connection to {}", remote_addr);
        };
        let message = InboundMessage::decode(command, WireBuf::new(payload, ByteOrder::BigEndian))
            .expect("undecodable test message");
        handler.handle_message(&transport, &mut TreeRegistry, message);
    }
}

#[async_trait]
impl Connector for CapturingConnector {
    async fn connect(&self, remote_addr: SocketAddr, priority: i16, handler: Arc<dyn ResponseHandler>) -> anyhow::Result<Arc<Transport>> {
        if self.refuse.load(Ordering::SeqCst) {
            bail!("connection to {} refused", remote_addr);
        }
        let (transport, senders) = Transport::new(remote_addr, priority, self.config.clone(), handler.clone());
        transport.verified();
        self.connections.lock().push(CapturedConnection {
            transport: transport.clone(),
            handler,
            senders,
        });
        Ok(transport)
    }
}
