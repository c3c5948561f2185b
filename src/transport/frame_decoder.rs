use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::protocol::header::{MessageHeader, Segment};
use crate::util::safe_converter::SafeCast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(MessageHeader),
    /// A complete application message. Segmented messages are reassembled, and their header is
    ///  the first segment's header with segmentation cleared and the total payload size.
    Application(MessageHeader, Bytes),
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    Payload(MessageHeader),
    /// discarding the payload of a dropped frame
    Skip(usize),
}

struct Reassembly {
    header: MessageHeader,
    buf: BytesMut,
}

/// The read side state machine of a transport: `header -> payload -> header ...`, with
///  reassembly of segmented messages.
///
/// The decoder consumes bytes from the front of the caller's buffer and leaves incomplete data
///  there, so the caller can just append whatever the socket delivers and call
///  [FrameDecoder::decode] until it returns `None`.
pub struct FrameDecoder {
    max_message_size: usize,
    state: DecodeState,
    reassembly: Option<Reassembly>,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> FrameDecoder {
        FrameDecoder {
            max_message_size,
            state: DecodeState::Header,
            reassembly: None,
        }
    }

    /// Returns the next complete frame, or `None` if more data is needed.
    ///
    /// An error means that the stream can not be interpreted any more (i.e. an invalid header),
    ///  and the connection must be closed. Oversized or out-of-sequence frames are not errors:
    ///  they are logged and dropped, and decoding continues after them.
    pub fn decode(&mut self, src: &mut BytesMut) -> anyhow::Result<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < MessageHeader::SERIALIZED_LEN {
                        return Ok(None);
                    }
                    let header = MessageHeader::deser(&src[..MessageHeader::SERIALIZED_LEN])?;
                    src.advance(MessageHeader::SERIALIZED_LEN);
                    trace!("received header {:?}", header);

                    if header.is_control() {
                        return Ok(Some(Frame::Control(header)));
                    }

                    let payload_size: usize = header.payload_size.safe_cast();
                    if payload_size > self.max_message_size {
                        warn!("message with command {} has {} bytes of payload, exceeding the maximum of {} - dropping", header.command, payload_size, self.max_message_size);
                        self.state = DecodeState::Skip(payload_size);
                        continue;
                    }
                    self.state = DecodeState::Payload(header);
                }
                DecodeState::Skip(remaining) => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    if n < remaining {
                        self.state = DecodeState::Skip(remaining - n);
                        return Ok(None);
                    }
                    self.state = DecodeState::Header;
                }
                DecodeState::Payload(header) => {
                    let payload_size: usize = header.payload_size.safe_cast();
                    if src.len() < payload_size {
                        src.reserve(payload_size - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(payload_size);
                    self.state = DecodeState::Header;

                    if let Some(frame) = self.on_payload(header, payload)? {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    fn on_payload(&mut self, header: MessageHeader, payload: BytesMut) -> anyhow::Result<Option<Frame>> {
        match header.segment() {
            Segment::Unsegmented => {
                if self.reassembly.take().is_some() {
                    warn!("unsegmented message while a segmented message was incomplete - dropping the incomplete message");
                }
                Ok(Some(Frame::Application(header, payload.freeze())))
            }
            Segment::First => {
                if self.reassembly.take().is_some() {
                    warn!("new segmented message while a segmented message was incomplete - dropping the incomplete message");
                }
                self.reassembly = Some(Reassembly { header, buf: payload });
                Ok(None)
            }
            Segment::Middle | Segment::Last => {
                let Some(mut reassembly) = self.reassembly.take() else {
                    warn!("segment of command {} without a first segment - dropping", header.command);
                    return Ok(None);
                };
                if reassembly.header.command != header.command {
                    warn!("segment of command {} continues a message of command {} - dropping both", header.command, reassembly.header.command);
                    return Ok(None);
                }
                if reassembly.buf.len() + payload.len() > self.max_message_size {
                    warn!("segmented message with command {} exceeds the maximum size of {} - dropping", header.command, self.max_message_size);
                    return Ok(None);
                }
                reassembly.buf.unsplit(payload);

                if header.segment() == Segment::Middle {
                    self.reassembly = Some(reassembly);
                    return Ok(None);
                }

                let total = reassembly.buf.freeze();
                let Ok(total_size) = u32::try_from(total.len()) else {
                    bail!("reassembled message size overflow");
                };
                let mut header = reassembly.header.with_segment(Segment::Unsegmented);
                header.payload_size = total_size;
                Ok(Some(Frame::Application(header, total)))
            }
        }
    }
}
