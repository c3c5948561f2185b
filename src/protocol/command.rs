use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Application message commands. This is a closed set: receiving any other code is a
///  protocol fault that drops the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    Beacon = 0,
    ConnectionValidation = 1,
    Echo = 2,
    Search = 3,
    SearchResponse = 4,
    AuthNz = 5,
    AclChange = 6,
    CreateChannel = 7,
    DestroyChannel = 8,
    ConnectionValidated = 9,
    Get = 10,
    Put = 11,
    PutGet = 12,
    Monitor = 13,
    Array = 14,
    DestroyRequest = 15,
    Process = 16,
    GetField = 17,
    Message = 18,
    MultipleData = 19,
    Rpc = 20,
    CancelRequest = 21,
    OriginTag = 22,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlCommand {
    /// value: total number of bytes sent so far
    SetMarker = 0,
    /// value: the marker being acknowledged
    AckMarker = 1,
    /// byte order is taken from the header flags
    SetByteOrder = 2,
    EchoRequest = 3,
    EchoResponse = 4,
}

bitflags! {
    /// The sub-operation selector sent with every request message
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct Qos: u8 {
        const PROCESS = 0x04;
        const INIT    = 0x08;
        const DESTROY = 0x10;
        const SHARE   = 0x20;
        const GET     = 0x40;
        const GET_PUT = 0x80;
    }
}
