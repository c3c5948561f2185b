use bytes::buf::UninitSlice;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::protocol::command::{Command, ControlCommand};
use crate::protocol::header::{MessageHeader, Segment};
use crate::util::safe_converter::PrecheckedCast;

/// The outbound byte buffer of a transport. It is owned by the transport's send worker, and
///  senders write into it between [SendBuffer::start_message] and [SendBuffer::end_message].
///
/// Data is collected in *fills* of at most `capacity` bytes; a completed fill is handed to the
///  socket as a whole. A message that does not fit into the rest of the current fill is split
///  into segments: the first segment uses up the current fill, and the remaining segments
///  continue in the next fills.
///
/// Flow control markers are interleaved at message boundaries once at least `marker_period`
///  bytes were written since the previous marker.
pub struct SendBuffer {
    capacity: usize,
    marker_period: u64,

    fill: BytesMut,
    ready: Vec<Bytes>,

    /// payload of the message that is currently being written
    payload: BytesMut,
    current_command: Option<u8>,

    /// total number of bytes moved into fills so far
    position: u64,
    next_marker: u64,
}

impl SendBuffer {
    pub fn new(capacity: usize, marker_period: u64) -> SendBuffer {
        assert!(capacity > MessageHeader::SERIALIZED_LEN, "send buffer must have room for more than a header");

        SendBuffer {
            capacity,
            marker_period,
            fill: BytesMut::with_capacity(capacity),
            ready: Vec::new(),
            payload: BytesMut::new(),
            current_command: None,
            position: 0,
            next_marker: marker_period,
        }
    }

    /// `size_hint` is a best guess for the payload size. If the message is expected to fit into an
    ///  empty fill but not into the rest of the current fill, the current fill is completed first
    ///  so that small messages are not segmented needlessly.
    pub fn start_message(&mut self, command: Command, size_hint: usize) {
        if let Some(previous) = self.current_command.take() {
            warn!("message with command {} was not ended - discarding it", previous);
            self.payload.clear();
        }

        if self.position + self.fill.len() as u64 >= self.next_marker {
            let marker = (self.position + self.fill.len() as u64) as u32;
            trace!("interleaving flow control marker {}", marker);
            self.put_control(ControlCommand::SetMarker, marker);
            self.next_marker = self.position + self.fill.len() as u64 + self.marker_period;
        }

        let expected_len = MessageHeader::SERIALIZED_LEN + size_hint;
        if expected_len <= self.capacity && self.fill.len() + expected_len > self.capacity {
            self.complete_fill();
        }

        self.current_command = Some(command.into());
    }

    /// Frames the message written since [SendBuffer::start_message], segmenting it if necessary.
    pub fn end_message(&mut self) {
        let Some(command) = self.current_command.take() else {
            warn!("end_message without start_message - ignoring");
            return;
        };

        let mut payload = self.payload.split().freeze();

        if self.fill.len() + MessageHeader::SERIALIZED_LEN + payload.len() <= self.capacity {
            self.put_frame(MessageHeader::application(command, payload.len().prechecked_cast(), Segment::Unsegmented), &payload);
            return;
        }
        if MessageHeader::SERIALIZED_LEN + payload.len() <= self.capacity {
            self.complete_fill();
            self.put_frame(MessageHeader::application(command, payload.len().prechecked_cast(), Segment::Unsegmented), &payload);
            return;
        }

        trace!("segmenting message with command {} and {} bytes of payload", command, payload.len());
        let mut is_first = true;
        while !payload.is_empty() {
            let available = self.capacity - self.fill.len();
            if available <= MessageHeader::SERIALIZED_LEN {
                self.complete_fill();
                continue;
            }

            let chunk = payload.split_to((available - MessageHeader::SERIALIZED_LEN).min(payload.len()));
            let segment = match (is_first, payload.is_empty()) {
                (true, true) => Segment::Unsegmented,
                (true, false) => Segment::First,
                (false, false) => Segment::Middle,
                (false, true) => Segment::Last,
            };
            self.put_frame(MessageHeader::application(command, chunk.len().prechecked_cast(), segment), &chunk);
            is_first = false;
        }
    }

    /// Drops a partially written message, e.g. after a sender failed to serialize its data
    pub fn abandon_message(&mut self) {
        self.current_command = None;
        self.payload.clear();
    }

    /// Control messages have no payload and are never segmented
    pub fn put_control(&mut self, command: ControlCommand, value: u32) {
        if self.fill.len() + MessageHeader::SERIALIZED_LEN > self.capacity {
            self.complete_fill();
        }
        MessageHeader::control(command.into(), value).ser(&mut self.fill);
    }

    /// the payload of the message currently being written
    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    /// Completes the current fill (if it contains data) and returns all completed fills
    pub fn flush(&mut self) -> Vec<Bytes> {
        self.complete_fill();
        std::mem::take(&mut self.ready)
    }

    pub fn position(&self) -> u64 {
        self.position + self.fill.len() as u64
    }

    fn put_frame(&mut self, header: MessageHeader, payload: &[u8]) {
        header.ser(&mut self.fill);
        self.fill.put_slice(payload);
        if self.fill.len() >= self.capacity {
            self.complete_fill();
        }
    }

    fn complete_fill(&mut self) {
        if self.fill.is_empty() {
            return;
        }
        self.position += self.fill.len() as u64;
        self.ready.push(self.fill.split().freeze());
    }
}

unsafe impl BufMut for SendBuffer {
    fn remaining_mut(&self) -> usize {
        self.payload.remaining_mut()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.payload.advance_mut(cnt)
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        self.payload.chunk_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::HeaderFlags;
    use rstest::rstest;

    fn headers(fills: &[Bytes]) -> Vec<MessageHeader> {
        let mut result = Vec::new();
        for fill in fills {
            let mut offset = 0;
            while offset < fill.len() {
                let header = MessageHeader::deser(&fill[offset..]).unwrap();
                offset += MessageHeader::SERIALIZED_LEN;
                if !header.is_control() {
                    offset += header.payload_size as usize;
                }
                result.push(header);
            }
            assert_eq!(offset, fill.len());
        }
        result
    }

    #[test]
    fn test_small_messages_share_a_fill() {
        let mut buf = SendBuffer::new(100, 1_000_000);
        for i in 0..3u32 {
            buf.start_message(Command::Get, 4);
            buf.put_u32(i);
            buf.end_message();
        }
        let fills = buf.flush();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].len(), 3 * 12);

        let headers = headers(&fills);
        assert!(headers.iter().all(|h| h.segment() == Segment::Unsegmented));
        assert!(headers.iter().all(|h| h.flags.contains(HeaderFlags::BIG_ENDIAN)));
    }

    #[test]
    fn test_size_hint_starts_new_fill() {
        let mut buf = SendBuffer::new(100, 1_000_000);
        buf.start_message(Command::Get, 50);
        buf.put_slice(&[1; 50]);
        buf.end_message();
        buf.start_message(Command::Put, 50);
        buf.put_slice(&[2; 50]);
        buf.end_message();

        let fills = buf.flush();
        assert_eq!(fills.len(), 2);
        assert!(headers(&fills).iter().all(|h| h.segment() == Segment::Unsegmented));
    }

    #[rstest]
    #[case::fits_in_rest(20, vec![Segment::Unsegmented])]
    #[case::two_segments(100, vec![Segment::First, Segment::Last])]
    #[case::three_segments(200, vec![Segment::First, Segment::Middle, Segment::Last])]
    fn test_segmentation(#[case] payload_len: usize, #[case] expected: Vec<Segment>) {
        let mut buf = SendBuffer::new(100, 1_000_000);
        buf.start_message(Command::Rpc, 0);
        buf.put_slice(&vec![7; payload_len]);
        buf.end_message();

        let fills = buf.flush();
        assert!(fills.iter().all(|f| f.len() <= 100));
        let headers = headers(&fills);
        assert_eq!(headers.iter().map(|h| h.segment()).collect::<Vec<_>>(), expected);
        assert!(headers.iter().all(|h| h.command == u8::from(Command::Rpc)));
        assert_eq!(headers.iter().map(|h| h.payload_size as usize).sum::<usize>(), payload_len);
    }

    #[test]
    fn test_segmented_message_continues_in_partial_fill() {
        let mut buf = SendBuffer::new(100, 1_000_000);
        buf.start_message(Command::Get, 0);
        buf.put_slice(&[0; 30]);
        buf.end_message();
        buf.start_message(Command::Put, 0);
        buf.put_slice(&[1; 140]);
        buf.end_message();

        let fills = buf.flush();
        let headers = headers(&fills);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[1].segment(), Segment::First);
        assert_eq!(headers[1].payload_size, 100 - 38 - 8);
        assert_eq!(headers[2].segment(), Segment::Last);
        assert_eq!(fills[0].len(), 100);
    }

    #[test]
    fn test_markers() {
        let mut buf = SendBuffer::new(1000, 50);
        for _ in 0..10 {
            buf.start_message(Command::Get, 12);
            buf.put_slice(&[0; 12]);
            buf.end_message();
        }
        let fills = buf.flush();
        let markers = headers(&fills).into_iter()
            .filter(|h| h.is_control())
            .collect::<Vec<_>>();

        assert_eq!(markers.len(), 3);
        assert!(markers.iter().all(|m| m.command == u8::from(ControlCommand::SetMarker)));
        assert_eq!(markers[0].payload_size, 60);
        assert!(markers.windows(2).all(|w| w[1].payload_size >= w[0].payload_size + 50));
    }

    #[test]
    fn test_abandon_message() {
        let mut buf = SendBuffer::new(100, 1_000_000);
        buf.start_message(Command::Get, 4);
        buf.put_u32(1);
        buf.abandon_message();
        buf.start_message(Command::Put, 4);
        buf.put_u32(2);
        buf.end_message();

        let fills = buf.flush();
        assert_eq!(fills.len(), 1);
        assert_eq!(&fills[0][MessageHeader::SERIALIZED_LEN..], &[0, 0, 0, 2]);
        assert_eq!(buf.position(), 12);
    }

    #[test]
    fn test_flush_empty() {
        let mut buf = SendBuffer::new(100, 50);
        assert!(buf.flush().is_empty());
    }
}
