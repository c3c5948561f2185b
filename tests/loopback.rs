//! A client context against a minimal server on loopback sockets: search over UDP, then
//!  connection validation, channel creation and a get over TCP.

use std::sync::Arc;
use std::time::Duration;

use bit_set::BitSet;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use pva_client::client::channel::ConnectionState;
use pva_client::client::request::Operation;
use pva_client::client::{ClientContext, DEFAULT_PRIORITY};
use pva_client::codec::FieldDesc;
use pva_client::config::ClientConfig;
use pva_client::protocol::command::{Command, Qos};
use pva_client::protocol::header::{MessageHeader, Segment};
use pva_client::protocol::messages::{unspecified_addr, ConnectionValidationRequest, CreateChannelRequest, CreateChannelResponse, SearchRequest, SearchResponse};
use pva_client::protocol::status::Status;
use pva_client::protocol::wire::WireBuf;
use pva_client::test_util::client::{init_response, value_response, RecordedData, RecordingChannelRequester, RecordingRequester, RequestEvent};
use pva_client::test_util::codec::{sample_value, TreeCodec, TreeDesc};
use pva_client::transport::frame_decoder::{Frame, FrameDecoder};

const CHANNEL_NAME: &str = "loopback:value";
const SERVER_SID: u32 = 77;

fn server_message(command: Command, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    MessageHeader::application(command.into(), payload.len() as u32, Segment::Unsegmented).from_server().ser(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// answers search requests for [CHANNEL_NAME], pointing to `tcp_port` on the datagram's source
async fn serve_search(udp: UdpSocket, tcp_port: u16) {
    let mut buf = vec![0u8; 65536];
    loop {
        let Ok((n, from)) = udp.recv_from(&mut buf).await else {
            return;
        };
        let mut datagram = Bytes::copy_from_slice(&buf[..n]);
        while datagram.len() >= MessageHeader::SERIALIZED_LEN {
            let header = MessageHeader::deser(&datagram).unwrap();
            let end = MessageHeader::SERIALIZED_LEN + header.payload_size as usize;
            let payload = datagram.slice(MessageHeader::SERIALIZED_LEN..end);
            datagram = datagram.slice(end..);
            if header.command != u8::from(Command::Search) {
                continue;
            }

            let request = SearchRequest::deser(&mut WireBuf::new(payload, header.byte_order())).unwrap();
            let cids = request.channels.iter()
                .filter(|(_, name)| name == CHANNEL_NAME)
                .map(|(cid, _)| *cid)
                .collect::<Vec<_>>();
            if cids.is_empty() {
                continue;
            }

            let mut response = BytesMut::new();
            SearchResponse {
                guid: [7; 12],
                sequence_id: request.sequence_id,
                server_addr: unspecified_addr(tcp_port),
                protocol: "tcp".to_string(),
                found: true,
                cids,
            }.ser(&mut response);
            udp.send_to(&server_message(Command::SearchResponse, &response), from).await.unwrap();
        }
    }
}

async fn read_frame(decoder: &mut FrameDecoder, src: &mut BytesMut, stream: &mut TcpStream) -> Option<Frame> {
    loop {
        if let Some(frame) = decoder.decode(src).unwrap() {
            return Some(frame);
        }
        if stream.read_buf(src).await.ok()? == 0 {
            return None;
        }
    }
}

/// Serves a single connection with one channel of type [TreeDesc::flat] with three fields
async fn serve_connection(listener: TcpListener) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let desc = TreeDesc::flat(3);

    let mut validation = BytesMut::new();
    ConnectionValidationRequest {
        receive_buffer_size: 16384,
        registry_size: 100,
        auth_plugins: vec!["anonymous".to_string()],
    }.ser(&mut validation);
    stream.write_all(&server_message(Command::ConnectionValidation, &validation)).await.unwrap();

    let mut decoder = FrameDecoder::new(1 << 20);
    let mut src = BytesMut::new();
    while let Some(frame) = read_frame(&mut decoder, &mut src, &mut stream).await {
        let Frame::Application(header, payload) = frame else {
            continue;
        };
        let mut wire = WireBuf::new(payload, header.byte_order());

        let reply = match Command::try_from(header.command) {
            Ok(Command::ConnectionValidation) => {
                let mut buf = BytesMut::new();
                Status::ok().ser(&mut buf);
                server_message(Command::ConnectionValidated, &buf)
            }
            Ok(Command::CreateChannel) => {
                let request = CreateChannelRequest::deser(&mut wire).unwrap();
                assert_eq!(request.name, CHANNEL_NAME);
                let mut buf = BytesMut::new();
                CreateChannelResponse { cid: request.cid, sid: SERVER_SID, status: Status::ok() }.ser(&mut buf);
                server_message(Command::CreateChannel, &buf)
            }
            Ok(Command::Get) => {
                assert_eq!(wire.try_get_u32().unwrap(), SERVER_SID);
                let ioid = wire.try_get_u32().unwrap();
                let qos = Qos::from_bits_retain(wire.try_get_u8().unwrap());
                let payload = if qos.contains(Qos::INIT) {
                    init_response(ioid, &Status::ok(), &[Some(&desc as &dyn FieldDesc)])
                }
                else {
                    let value = sample_value(TreeDesc::flat(3));
                    value_response(ioid, qos, value.as_ref(), &[0].into_iter().collect::<BitSet>())
                };
                server_message(Command::Get, &payload)
            }
            _ => continue,
        };
        stream.write_all(&reply).await.unwrap();
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waiting = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), waiting).await.is_err() {
        panic!("timed out waiting for {}", what);
    }
}

#[tokio::test]
async fn test_search_connect_and_get() {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let search_addr = udp.local_addr().unwrap();
    let tcp_port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_search(udp, tcp_port));
    tokio::spawn(serve_connection(listener));

    let config = ClientConfig {
        search_addresses: vec![search_addr],
        auto_broadcast: false,
        broadcast_port: 0,
        ..ClientConfig::default()
    };
    let context = ClientContext::new(config, Arc::new(TreeCodec)).unwrap();

    let channel_requester = Arc::new(RecordingChannelRequester::default());
    let channel = context.create_channel(CHANNEL_NAME, channel_requester.clone(), DEFAULT_PRIORITY).unwrap();
    wait_until("channel connection", || channel.is_connected()).await;
    assert_eq!(channel.server_id(), Some(SERVER_SID));
    assert_eq!(channel.remote_addr().map(|a| a.port()), Some(tcp_port));

    let requester = Arc::new(RecordingRequester::default());
    let request = channel.create_get(requester.clone(), None).unwrap();
    wait_until("request initialization", || request.is_initialized()).await;
    assert_eq!(requester.take_events(), vec![RequestEvent::Connected(Status::ok())]);

    assert!(request.get().is_ok());
    wait_until("get completion", || !requester.events().is_empty()).await;
    assert_eq!(requester.take_events(), vec![
        RequestEvent::Completed(Operation::Get, Status::ok(), RecordedData::Value {
            values: vec![0, 10, 20, 30],
            changed: Some([0].into_iter().collect()),
        }),
    ]);

    context.shutdown();
    assert_eq!(channel.state(), ConnectionState::Destroyed);
    assert_eq!(channel_requester.states(), vec![ConnectionState::Connected, ConnectionState::Destroyed]);
}
