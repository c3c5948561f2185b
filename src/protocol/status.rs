use std::fmt::{Display, Formatter};

use bytes::BufMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::wire::WireBuf;
use crate::util::buf_ext::{BufMutExt, NULL_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StatusType {
    Ok = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

/// Outcome of an operation, both as received from a server and for locally detected
///  conditions. The local conditions have dedicated constructors so callers can compare
///  against them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub status_type: StatusType,
    pub message: String,
    pub call_tree: String,
}

impl Status {
    pub fn ok() -> Status {
        Status::new(StatusType::Ok, "")
    }

    pub fn new(status_type: StatusType, message: impl Into<String>) -> Status {
        Status {
            status_type,
            message: message.into(),
            call_tree: String::new(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Status {
        Status::new(StatusType::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Status {
        Status::new(StatusType::Error, message)
    }

    pub fn fatal(message: impl Into<String>) -> Status {
        Status::new(StatusType::Fatal, message)
    }

    pub fn request_destroyed() -> Status {
        Status::error("request destroyed")
    }

    pub fn channel_destroyed() -> Status {
        Status::error("channel destroyed")
    }

    pub fn channel_not_connected() -> Status {
        Status::error("channel not connected")
    }

    pub fn channel_disconnected() -> Status {
        Status::error("channel disconnected")
    }

    pub fn other_request_pending() -> Status {
        Status::error("other request pending")
    }

    pub fn not_initialized() -> Status {
        Status::error("request not initialized")
    }

    pub fn not_supported(operation: &str) -> Status {
        Status::error(format!("operation {} not supported by this request", operation))
    }

    pub fn cancelled() -> Status {
        Status::warning("request cancelled")
    }

    pub fn timed_out() -> Status {
        Status::error("request timed out")
    }

    /// `true` for OK and WARNING
    pub fn is_success(&self) -> bool {
        matches!(self.status_type, StatusType::Ok | StatusType::Warning)
    }

    pub fn is_ok(&self) -> bool {
        self.status_type == StatusType::Ok
    }

    /// An OK status without message and call tree is sent as a single byte
    pub fn ser(&self, buf: &mut impl BufMut) {
        if self.is_ok() && self.message.is_empty() && self.call_tree.is_empty() {
            buf.put_u8(NULL_SIZE);
            return;
        }
        buf.put_u8(self.status_type.into());
        buf.put_string(&self.message);
        buf.put_string(&self.call_tree);
    }

    pub fn deser(buf: &mut WireBuf) -> anyhow::Result<Status> {
        let raw_type = buf.try_get_u8()?;
        if raw_type == NULL_SIZE {
            return Ok(Status::ok());
        }
        let status_type = StatusType::try_from(raw_type)
            .map_err(|_| anyhow::anyhow!("invalid status type {}", raw_type))?;
        let message = buf.try_get_string()?;
        let call_tree = buf.try_get_string()?;
        Ok(Status {
            status_type,
            message,
            call_tree,
        })
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.status_type)
        }
        else {
            write!(f, "{:?}: {}", self.status_type, self.message)
        }
    }
}
