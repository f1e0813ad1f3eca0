use std::sync::Arc;

use super::traffic_state::{DirectionState, TrafficState};
use super::vision_filter::filter_tls;
use super::vision_unpad::unpad;
use crate::buf::{multi_len, MultiBuffer};

/// Read-side Vision engine for one direction.
///
/// Turns chunks read off the connection back into payload and decides when the peer has
/// moved on to plain payload or to the raw connection. Performs no I/O itself.
#[derive(Debug)]
pub struct VisionReader {
    traffic_state: Arc<TrafficState>,
    state: DirectionState,
}

impl VisionReader {
    pub fn new(traffic_state: Arc<TrafficState>) -> Self {
        Self {
            traffic_state,
            state: DirectionState::new(),
        }
    }

    pub fn state(&self) -> &DirectionState {
        &self.state
    }

    pub fn is_direct_copy(&self) -> bool {
        self.state.direct_copy
    }

    pub fn process(&mut self, mb: MultiBuffer) -> MultiBuffer {
        if self.state.direct_copy {
            return mb;
        }

        let mut mb = mb;
        if self.state.within_padding_buffers || self.traffic_state.packets_to_filter() > 0 {
            let user_uuid = *self.traffic_state.user_uuid();
            mb = mb
                .into_iter()
                .map(|chunk| unpad(chunk, &user_uuid, &mut self.state))
                .filter(|chunk| !chunk.is_empty())
                .collect();
            self.apply_transition(multi_len(&mb));
        }

        let mut tls = self.traffic_state.tls();
        if tls.is_filtering() {
            filter_tls(&mb, &mut tls);
        }

        mb
    }

    fn apply_transition(&mut self, len: usize) {
        let state = &mut self.state;
        if state.remaining_content > 0 || state.remaining_padding > 0 || state.current_command == 0
        {
            state.within_padding_buffers = true;
        } else if state.current_command == 1 {
            if state.within_padding_buffers {
                log::debug!("VISION READ: padding ended, {} payload bytes", len);
            }
            state.within_padding_buffers = false;
        } else if state.current_command == 2 {
            log::info!("VISION READ: peer switched to direct copy");
            state.switch_to_direct_copy();
        } else {
            log::warn!(
                "VISION READ: unknown padding command {}, passing {} bytes through",
                state.current_command,
                len
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vless::traffic_state::PaddingCommand;
    use crate::vless::vision_pad::{pad, PaddingSeed};
    use bytes::BytesMut;

    const UUID: [u8; 16] = [3u8; 16];

    fn frame(uuid: &mut Option<[u8; 16]>, command: PaddingCommand, content: &[u8]) -> BytesMut {
        pad(
            Some(BytesMut::from(content)),
            command,
            uuid,
            false,
            &PaddingSeed::default(),
        )
    }

    fn reader() -> VisionReader {
        VisionReader::new(Arc::new(TrafficState::new(UUID)))
    }

    #[test]
    fn test_continue_keeps_padding() {
        let mut reader = reader();
        let mut uuid = Some(UUID);
        let out = reader.process(vec![frame(&mut uuid, PaddingCommand::Continue, b"abc")]);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], b"abc");
        assert!(reader.state().within_padding_buffers);
        assert!(!reader.is_direct_copy());
    }

    #[test]
    fn test_end_then_plain_payload() {
        let mut reader = reader();
        let mut uuid = Some(UUID);
        let mut wire = frame(&mut uuid, PaddingCommand::Continue, b"one");
        wire.extend_from_slice(&frame(&mut uuid, PaddingCommand::End, b"two"));

        let out = reader.process(vec![wire]);
        assert_eq!(&out[0][..], b"onetwo");
        assert!(!reader.state().within_padding_buffers);
        assert!(!reader.is_direct_copy());

        // plain payload afterwards passes through untouched
        let out = reader.process(vec![BytesMut::from(&b"plain data"[..])]);
        assert_eq!(&out[0][..], b"plain data");
        assert!(!reader.state().within_padding_buffers);
    }

    #[test]
    fn test_direct_is_terminal() {
        let mut reader = reader();
        let mut uuid = Some(UUID);
        reader.process(vec![frame(&mut uuid, PaddingCommand::Direct, b"last")]);
        assert!(reader.is_direct_copy());
        assert!(!reader.state().within_padding_buffers);

        // even something that looks like a frame is no longer interpreted
        let mut uuid = Some(UUID);
        let looks_padded = frame(&mut uuid, PaddingCommand::Continue, b"x");
        let expected = looks_padded.clone();
        let out = reader.process(vec![looks_padded]);
        assert_eq!(out[0], expected);
        assert!(reader.is_direct_copy());
    }

    #[test]
    fn test_unknown_command_fails_open() {
        let mut reader = reader();
        let mut data = UUID.to_vec();
        data.extend_from_slice(&[9, 0, 3, 0, 0]);
        data.extend_from_slice(b"abcrest");
        let out = reader.process(vec![BytesMut::from(&data[..])]);
        assert_eq!(&out[0][..], b"abcrest");
        assert!(reader.state().within_padding_buffers);
        assert!(!reader.is_direct_copy());
    }

    #[test]
    fn test_unpadded_peer_passes_through() {
        let mut reader = reader();
        let out = reader.process(vec![BytesMut::from(&b"GET / HTTP/1.1\r\n\r\n"[..])]);
        assert_eq!(&out[0][..], b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(reader.traffic_state.packets_to_filter(), 7);
    }

    #[test]
    fn test_filter_window_is_non_increasing() {
        let mut reader = reader();
        let mut last = reader.traffic_state.packets_to_filter();
        for _ in 0..12 {
            reader.process(vec![BytesMut::from(&b"data"[..])]);
            let now = reader.traffic_state.packets_to_filter();
            assert!(now <= last);
            last = now;
        }
        assert_eq!(last, 0);
    }
}
