//! Client-side protocol engine for a channel-oriented process-control protocol: named remote
//!  variables ("channels") are resolved by UDP search, then read, written and monitored through
//!  framed TCP circuits.
//!
//! ## Design goals
//!
//! * One TCP connection (a [transport::Transport]) per server, shared by all channels that
//!   resolve to that server and reference counted by them
//! * All traffic on a connection goes through a single send worker that drains a FIFO queue of
//!   *senders*. Nobody else ever writes to the socket, so frames can not interleave
//! * A single receive worker per connection parses frames, reassembles segmented messages and
//!   dispatches complete payloads synchronously to channels and requests
//! * Channel names are resolved by an adaptive search scheduler with exponentially slower
//!   retry *buckets* and a congestion-avoiding frames-per-try budget
//! * Requests survive connection loss: they are suspended on disconnect and their `init`
//!   operation is replayed once the channel is connected again
//! * At most one wire operation is in flight per request, so responses can be matched to the
//!   operation unambiguously
//!
//! ## Header
//!
//! Every message (TCP and UDP) starts with a fixed 8-byte header:
//!
//! ```ascii
//! 0: magic (0xCA)
//! 1: protocol revision
//! 2: flags
//!    * bit 0:   0 application message, 1 control message
//!    * bit 4-5: segmentation - 00 unsegmented, 01 first, 11 middle, 10 last
//!    * bit 6:   0 sent by a client, 1 sent by a server
//!    * bit 7:   byte order of the rest of the message - 0 little endian, 1 big endian
//! 3: command
//! 4: payload size (u32) - for control messages, this is the control message's value instead
//! ```
//!
//! This crate always sends big endian and accepts both byte orders.
//!
//! ## Control messages
//!
//! Control messages have no payload. They carry flow control markers (the total number of bytes
//!  sent so far, echoed back by the peer so the sender can estimate how much unacknowledged
//!  data is outstanding), the peer's byte order, and transport-level echo.
//!
//! ## Segmentation
//!
//! A message that does not fit into the remaining space of the send buffer is split into
//!  segments, each with its own header carrying the same command. The receiver reassembles all
//!  segments before a payload is dispatched.
//!
//! ## Value encoding
//!
//! Values and their type descriptions are encoded by an external codec (see [codec]). The
//!  engine only moves encoded values around and tracks which fields changed.

pub mod client;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod search;
pub mod test_util;
pub mod transport;
pub mod util;
