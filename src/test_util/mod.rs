//! Test support that is exported for applications: a reference value codec, transports
//!  that are driven by the test instead of sockets, and recording requesters.
//!
//! These utilities are part of the crate's regular (non-#[cfg(test)]) code so that code
//!  outside this crate can use them in its own tests.

pub mod client;
pub mod codec;
pub mod transport;
