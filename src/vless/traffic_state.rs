//! Connection-scoped Vision state.
//!
//! [`TrafficState`] holds what both directions observe together: the user identity and the
//! TLS detection results. Each direction additionally owns a [`DirectionState`] that only its
//! own engine touches.

use std::io;

use parking_lot::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PaddingCommand {
    /// Another padding frame follows.
    Continue = 0,
    /// Padding is over, plain payload follows.
    End = 1,
    /// Padding is over, the sender switches to the raw connection.
    Direct = 2,
}

impl TryFrom<u8> for PaddingCommand {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PaddingCommand::Continue),
            1 => Ok(PaddingCommand::End),
            2 => Ok(PaddingCommand::Direct),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown padding command: {value}"),
            )),
        }
    }
}

/// TLS detection results shared by both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsState {
    pub packets_to_filter: u32,
    pub is_tls: bool,
    pub is_tls12_or_above: bool,
    pub enable_xtls: bool,
    pub cipher: u16,
    /// Bytes left in the ServerHello record being inspected, -1 when none was seen.
    pub remaining_server_hello: i32,
}

impl TlsState {
    pub fn new(packets_to_filter: u32) -> Self {
        Self {
            packets_to_filter,
            is_tls: false,
            is_tls12_or_above: false,
            enable_xtls: false,
            cipher: 0,
            remaining_server_hello: -1,
        }
    }

    pub fn is_filtering(&self) -> bool {
        self.packets_to_filter > 0
    }

    pub fn stop_filtering(&mut self, reason: &str) {
        log::debug!("VISION FILTER: stopping filtering - {}", reason);
        self.packets_to_filter = 0;
    }
}

/// Parser cursors and mode flags for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionState {
    pub within_padding_buffers: bool,
    pub direct_copy: bool,
    pub remaining_command: i32,
    pub remaining_content: i32,
    pub remaining_padding: i32,
    pub current_command: u8,
    pub is_padding: bool,
}

impl Default for DirectionState {
    fn default() -> Self {
        Self {
            within_padding_buffers: true,
            direct_copy: false,
            remaining_command: -1,
            remaining_content: -1,
            remaining_padding: -1,
            current_command: 0,
            is_padding: true,
        }
    }
}

impl DirectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the next bytes must start with the user identity marker.
    pub fn awaiting_marker(&self) -> bool {
        self.remaining_command == -1 && self.remaining_content == -1 && self.remaining_padding == -1
    }

    pub fn at_block_boundary(&self) -> bool {
        self.remaining_command <= 0 && self.remaining_content <= 0 && self.remaining_padding <= 0
    }

    pub fn reset_cursors(&mut self) {
        self.remaining_command = -1;
        self.remaining_content = -1;
        self.remaining_padding = -1;
    }

    /// Irreversible.
    pub fn switch_to_direct_copy(&mut self) {
        self.within_padding_buffers = false;
        self.direct_copy = true;
    }
}

/// State for one proxied connection, shared by its reader and writer.
#[derive(Debug)]
pub struct TrafficState {
    user_uuid: [u8; 16],
    tls: Mutex<TlsState>,
}

impl TrafficState {
    pub fn new(user_uuid: [u8; 16]) -> Self {
        Self::with_packets_to_filter(user_uuid, 8)
    }

    pub fn with_packets_to_filter(user_uuid: [u8; 16], packets_to_filter: u32) -> Self {
        Self {
            user_uuid,
            tls: Mutex::new(TlsState::new(packets_to_filter)),
        }
    }

    pub fn user_uuid(&self) -> &[u8; 16] {
        &self.user_uuid
    }

    pub fn tls(&self) -> MutexGuard<'_, TlsState> {
        self.tls.lock()
    }

    pub fn snapshot(&self) -> TlsState {
        self.tls.lock().clone()
    }

    pub fn packets_to_filter(&self) -> u32 {
        self.tls.lock().packets_to_filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_command_from_u8() {
        assert_eq!(PaddingCommand::try_from(0).unwrap(), PaddingCommand::Continue);
        assert_eq!(PaddingCommand::try_from(1).unwrap(), PaddingCommand::End);
        assert_eq!(PaddingCommand::try_from(2).unwrap(), PaddingCommand::Direct);
        assert_eq!(
            PaddingCommand::try_from(3).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_initial_direction_state() {
        let state = DirectionState::new();
        assert!(state.within_padding_buffers);
        assert!(!state.direct_copy);
        assert!(state.is_padding);
        assert!(state.awaiting_marker());
        assert!(state.at_block_boundary());
    }

    #[test]
    fn test_switch_to_direct_copy() {
        let mut state = DirectionState::new();
        state.switch_to_direct_copy();
        assert!(state.direct_copy);
        assert!(!state.within_padding_buffers);
    }

    #[test]
    fn test_stop_filtering_is_sticky() {
        let traffic_state = TrafficState::new([1u8; 16]);
        assert_eq!(traffic_state.packets_to_filter(), 8);
        traffic_state.tls().stop_filtering("test");
        assert_eq!(traffic_state.packets_to_filter(), 0);
        assert!(!traffic_state.snapshot().is_filtering());
        assert_eq!(traffic_state.snapshot().remaining_server_hello, -1);
    }
}
