pub mod opcode {
    pub const ERROR: u8 = 0x10;
    pub const PLATE: u8 = 0x20;
    pub const TICKET: u8 = 0x21;
    pub const WANT_HEARTBEAT: u8 = 0x40;
    pub const HEARTBEAT: u8 = 0x41;
    pub const I_AM_CAMERA: u8 = 0x80;
    pub const I_AM_DISPATCHER: u8 = 0x81;
}

/// Messages a client may legally send us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromClient {
    Plate { plate: String, timestamp: u32 },
    WantHeartbeat { interval: u32 },
    IAmCamera { road: u16, mile: u16, limit: u16 },
    IAmDispatcher { roads: Vec<u16> },
}

/// Messages we emit towards a client.
///
/// The ticket speed field is in hundredths of a mile per hour,
/// exactly as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToClient {
    Error {
        msg: String,
    },
    Ticket {
        plate: String,
        road: u16,
        mile1: u16,
        timestamp1: u32,
        mile2: u16,
        timestamp2: u32,
        speed: u16,
    },
    Heartbeat,
}

impl ToClient {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error { msg: reason.into() }
    }
}
