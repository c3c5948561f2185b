//! The I/O side of a transport: connecting, and the send, receive and liveness workers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, instrument, trace, warn};

use crate::codec::{FieldRegistry, ValueCodec};
use crate::config::ClientConfig;
use crate::protocol::command::{Command, ControlCommand};
use crate::protocol::header::MessageHeader;
use crate::protocol::messages::{ConnectionValidationRequest, ConnectionValidationResponse, InboundMessage, AUTH_ANONYMOUS};
use crate::protocol::status::Status;
use crate::protocol::wire::WireBuf;
use crate::transport::frame_decoder::{Frame, FrameDecoder};
use crate::transport::send_buffer::SendBuffer;
use crate::transport::{ControlSender, ResponseHandler, Transport, TransportPhase, TransportSender, ValidationSender};

/// size of the introspection registry announced to servers
const REGISTRY_SIZE: u16 = 0x7fff;

/// Connects to a server and waits for the validation handshake to complete.
pub async fn connect(
    remote_addr: SocketAddr,
    priority: i16,
    config: Arc<ClientConfig>,
    codec: &dyn ValueCodec,
    handler: Arc<dyn ResponseHandler>,
) -> anyhow::Result<Arc<Transport>> {
    debug!("connecting to {}", remote_addr);
    let stream = timeout(config.connection_timeout, TcpStream::connect(remote_addr)).await
        .map_err(|_| anyhow!("timeout connecting to {}", remote_addr))??;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();

    let connection_timeout = config.connection_timeout;
    let (transport, senders) = Transport::new(remote_addr, priority, config, handler);
    spawn_workers(&transport, reader, writer, senders, codec.new_registry());

    if !timeout(connection_timeout, transport.wait_verified()).await.unwrap_or(false) {
        transport.close();
        anyhow::bail!("connection validation with {} failed", remote_addr);
    }
    Ok(transport)
}

/// Starts the send, receive and liveness workers for a transport on arbitrary I/O halves.
pub fn spawn_workers(
    transport: &Arc<Transport>,
    reader: impl AsyncRead + Unpin + Send + 'static,
    writer: impl AsyncWrite + Unpin + Send + 'static,
    senders: mpsc::UnboundedReceiver<Arc<dyn TransportSender>>,
    registry: Box<dyn FieldRegistry>,
) {
    let handles = [
        tokio::spawn(send_loop(transport.clone(), writer, senders)),
        tokio::spawn(receive_loop(transport.clone(), reader, registry)),
        tokio::spawn(liveness_loop(transport.clone())),
    ];
    transport.add_workers(handles);
}

async fn wait_closed(phase: &mut watch::Receiver<TransportPhase>) {
    let _ = phase.wait_for(|p| *p == TransportPhase::Closed).await;
}

#[instrument(skip_all, fields(peer = %transport.remote_addr()))]
async fn send_loop(transport: Arc<Transport>, mut writer: impl AsyncWrite + Unpin, mut senders: mpsc::UnboundedReceiver<Arc<dyn TransportSender>>) {
    let mut phase = transport.subscribe_phase();
    let mut buffer = SendBuffer::new(transport.config().send_buffer_size, transport.config().marker_period_bytes);

    loop {
        let sender = tokio::select! {
            s = senders.recv() => match s {
                Some(s) => s,
                None => break,
            },
            _ = wait_closed(&mut phase) => break,
        };

        write_sender(&transport, sender.as_ref(), &mut buffer);
        // drain whatever else is queued so that small messages share a fill
        while let Ok(sender) = senders.try_recv() {
            write_sender(&transport, sender.as_ref(), &mut buffer);
        }

        for fill in buffer.flush() {
            trace!("writing {} bytes", fill.len());
            if let Err(e) = writer.write_all(&fill).await {
                debug!("error writing: {}", e);
                transport.close();
                return;
            }
            transport.flow().record_sent(fill.len());
        }
        if let Err(e) = writer.flush().await {
            debug!("error flushing: {}", e);
            transport.close();
            return;
        }

        if transport.flow().is_congested() {
            trace!("{} bytes unacknowledged - pausing", transport.unacknowledged_bytes());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    let _ = writer.shutdown().await;
    debug!("send worker terminated");
}

fn write_sender(transport: &Transport, sender: &dyn TransportSender, buffer: &mut SendBuffer) {
    if let Err(e) = sender.send(buffer, transport) {
        warn!("error serializing message - dropping it: {}", e);
        buffer.abandon_message();
    }
}

#[instrument(skip_all, fields(peer = %transport.remote_addr()))]
async fn receive_loop(transport: Arc<Transport>, mut reader: impl AsyncRead + Unpin, mut registry: Box<dyn FieldRegistry>) {
    let mut phase = transport.subscribe_phase();
    let mut decoder = FrameDecoder::new(transport.config().max_message_size);
    let mut src = BytesMut::with_capacity(transport.config().receive_buffer_size);

    loop {
        let read = tokio::select! {
            r = reader.read_buf(&mut src) => r,
            _ = wait_closed(&mut phase) => break,
        };
        match read {
            Ok(0) => {
                debug!("connection closed by peer");
                break;
            }
            Ok(n) => trace!("received {} bytes", n),
            Err(e) => {
                debug!("error reading: {}", e);
                break;
            }
        }
        transport.alive_notification();

        loop {
            match decoder.decode(&mut src) {
                Ok(Some(frame)) => dispatch_frame(&transport, frame, registry.as_mut()),
                Ok(None) => break,
                Err(e) => {
                    warn!("unrecoverable framing error - closing connection: {}", e);
                    transport.close();
                    return;
                }
            }
        }
        if src.capacity() - src.len() < 1024 {
            src.reserve(transport.config().receive_buffer_size);
        }
    }
    transport.close();
    debug!("receive worker terminated");
}

#[instrument(skip_all, fields(peer = %transport.remote_addr()))]
async fn liveness_loop(transport: Arc<Transport>) {
    let mut phase = transport.subscribe_phase();
    let config = transport.config().clone();
    let period = (config.echo_period.min(config.connection_timeout) / 4).max(Duration::from_millis(10));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_closed(&mut phase) => break,
        }
        transport.check_liveness();
    }
}

/// Handles a received frame. Connection-level messages are handled here, everything else goes
///  to the transport's response handler.
pub fn dispatch_frame(transport: &Arc<Transport>, frame: Frame, registry: &mut dyn FieldRegistry) {
    match frame {
        Frame::Control(header) => on_control(transport, header),
        Frame::Application(header, payload) => {
            transport.on_peer_revision(header.version);

            let Ok(command) = Command::try_from(header.command) else {
                warn!("unknown command {} - dropping frame", header.command);
                return;
            };
            let message = match InboundMessage::decode(command, WireBuf::new(payload, header.byte_order())) {
                Ok(m) => m,
                Err(e) => {
                    warn!("malformed {:?} message - dropping frame: {}", command, e);
                    return;
                }
            };
            trace!("received {:?}", message);

            match message {
                InboundMessage::ConnectionValidation(request) => on_validation_request(transport, request),
                InboundMessage::ConnectionValidated(status) => on_validated(transport, status),
                InboundMessage::Echo(_) => trace!("echo response"),
                InboundMessage::Ignored(command) => debug!("ignoring {:?} message", command),
                other => transport.handler().handle_message(transport, registry, other),
            }
        }
    }
}

fn on_control(transport: &Transport, header: MessageHeader) {
    let value = header.payload_size;
    match ControlCommand::try_from(header.command) {
        Ok(ControlCommand::SetMarker) => transport.enqueue(Arc::new(ControlSender { command: ControlCommand::AckMarker, value })),
        Ok(ControlCommand::AckMarker) => transport.flow().on_marker_ack(value),
        Ok(ControlCommand::SetByteOrder) => debug!("peer announced byte order {:?}", header.byte_order()),
        Ok(ControlCommand::EchoRequest) => transport.enqueue(Arc::new(ControlSender { command: ControlCommand::EchoResponse, value })),
        Ok(ControlCommand::EchoResponse) => trace!("echo response"),
        Err(_) => warn!("unknown control command {} - ignoring", header.command),
    }
}

fn on_validation_request(transport: &Transport, request: ConnectionValidationRequest) {
    debug!("server requests validation: {:?}", request);
    transport.flow().set_remote_buffer_size(request.receive_buffer_size);

    let auth_plugin = if request.auth_plugins.iter().any(|p| p == AUTH_ANONYMOUS) {
        AUTH_ANONYMOUS.to_string()
    }
    else {
        String::new()
    };
    transport.enqueue(Arc::new(ValidationSender(ConnectionValidationResponse {
        receive_buffer_size: transport.config().receive_buffer_size.try_into().unwrap_or(u32::MAX),
        registry_size: REGISTRY_SIZE,
        priority: transport.priority(),
        auth_plugin,
    })));
}

fn on_validated(transport: &Arc<Transport>, status: Status) {
    if status.is_success() {
        transport.verified();
    }
    else {
        warn!("server rejected connection: {}", status);
        transport.close();
    }
}
