use std::io;

// VLESS protocol command types
pub const COMMAND_TCP: u8 = 1;
pub const COMMAND_UDP: u8 = 2;
pub const COMMAND_MUX: u8 = 3; // Also known as XUDP - multiplexes UDP over single TCP connection

pub const XTLS_VISION_FLOW: &str = "xtls-rprx-vision";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCommand {
    Tcp,
    Udp,
    Mux,
}

impl TryFrom<u8> for RequestCommand {
    type Error = io::Error;

    fn try_from(value: u8) -> io::Result<Self> {
        match value {
            COMMAND_TCP => Ok(RequestCommand::Tcp),
            COMMAND_UDP => Ok(RequestCommand::Udp),
            COMMAND_MUX => Ok(RequestCommand::Mux),
            unknown => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown request command: {unknown}"),
            )),
        }
    }
}

/// Request addons, as decoded by the header codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addons {
    pub flow: String,
}

/// The decoded parts of a VLESS request header that decide whether Vision runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub user_id: [u8; 16],
    pub command: RequestCommand,
    pub port: u16,
    pub addons: Addons,
}

/// Decides whether the Vision flow applies to the request.
///
/// Errors mean the connection has to be refused.
pub fn vision_enabled(header: &RequestHeader) -> io::Result<bool> {
    match header.addons.flow.as_str() {
        "" => Ok(false),
        XTLS_VISION_FLOW => match header.command {
            RequestCommand::Tcp | RequestCommand::Mux => Ok(true),
            RequestCommand::Udp if header.port == 443 => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("XTLS rejected UDP/443 traffic (flow {XTLS_VISION_FLOW})"),
            )),
            RequestCommand::Udp => {
                log::debug!("VISION: udp request on port {}, flow disabled", header.port);
                Ok(false)
            }
        },
        unknown => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown flow: {unknown}"),
        )),
    }
}
