//! Wire-level building blocks: message header, command codes, status, and the typed
//!  messages that the engine itself (rather than the value codec) understands.

pub mod command;
pub mod header;
pub mod messages;
pub mod status;
pub mod wire;
