use std::sync::atomic::{AtomicU64, Ordering};

/// Bookkeeping for the marker based flow control. The sender periodically interleaves a marker
///  with the total number of bytes sent so far, and the peer echoes it back once it has
///  processed everything up to the marker. The difference is an estimate of data in flight.
///
/// This is purely advisory: it slows the send worker down, it never blocks or drops messages.
#[derive(Debug, Default)]
pub struct FlowControl {
    bytes_sent: AtomicU64,
    bytes_acked: AtomicU64,
    remote_buffer_size: AtomicU64,
}

impl FlowControl {
    pub fn record_sent(&self, num_bytes: usize) {
        self.bytes_sent.fetch_add(num_bytes as u64, Ordering::AcqRel);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    /// Markers carry only the lower 32 bits of the position, so the full position is
    ///  reconstructed as the highest value not exceeding the bytes sent so far.
    pub fn on_marker_ack(&self, value: u32) {
        let sent = self.bytes_sent();
        let mut candidate = (sent & !0xffff_ffff) | value as u64;
        if candidate > sent {
            match candidate.checked_sub(1 << 32) {
                Some(c) => candidate = c,
                None => return,
            }
        }
        self.bytes_acked.fetch_max(candidate, Ordering::AcqRel);
    }

    pub fn set_remote_buffer_size(&self, size: u32) {
        self.remote_buffer_size.store(size as u64, Ordering::Release);
    }

    pub fn unacknowledged_bytes(&self) -> u64 {
        self.bytes_sent().saturating_sub(self.bytes_acked.load(Ordering::Acquire))
    }

    /// `true` if more data is in flight than the peer announced it can buffer
    pub fn is_congested(&self) -> bool {
        let remote = self.remote_buffer_size.load(Ordering::Acquire);
        remote > 0 && self.unacknowledged_bytes() > remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nothing_acked(1000, None, 1000)]
    #[case::partially_acked(1000, Some(400), 600)]
    #[case::fully_acked(1000, Some(1000), 0)]
    #[case::ack_beyond_sent_is_ignored(1000, Some(2000), 1000)]
    fn test_unacknowledged(#[case] sent: usize, #[case] ack: Option<u32>, #[case] expected: u64) {
        let flow = FlowControl::default();
        flow.record_sent(sent);
        if let Some(ack) = ack {
            flow.on_marker_ack(ack);
        }
        assert_eq!(flow.unacknowledged_bytes(), expected);
    }

    #[test]
    fn test_wrapped_marker() {
        let flow = FlowControl::default();
        flow.record_sent((1usize << 32) + 100);
        flow.on_marker_ack(50);
        assert_eq!(flow.unacknowledged_bytes(), 50);
        flow.on_marker_ack(u32::MAX);
        assert_eq!(flow.unacknowledged_bytes(), 50);
    }

    #[test]
    fn test_stale_ack_does_not_move_backwards() {
        let flow = FlowControl::default();
        flow.record_sent(1000);
        flow.on_marker_ack(800);
        flow.on_marker_ack(300);
        assert_eq!(flow.unacknowledged_bytes(), 200);
    }

    #[test]
    fn test_congestion() {
        let flow = FlowControl::default();
        flow.record_sent(5000);
        assert!(!flow.is_congested());
        flow.set_remote_buffer_size(4096);
        assert!(flow.is_congested());
        flow.on_marker_ack(2000);
        assert!(!flow.is_congested());
    }
}
