use bytes::{Buf, BytesMut};
use subtle::ConstantTimeEq;

use super::traffic_state::DirectionState;
use super::vision_pad::{FRAME_OVERHEAD, HEADER_LEN, MARKER_LEN};

/// Strips padding frames from `chunk`, returning the payload bytes it carried.
///
/// Parsing resumes from the cursors in `state`, so a frame may span any number of chunks.
/// When the cursors are at their initial position the chunk must begin with the user
/// identity marker; otherwise it is not padded at all and is returned as-is.
pub fn unpad(mut chunk: BytesMut, user_uuid: &[u8; 16], state: &mut DirectionState) -> BytesMut {
    if state.awaiting_marker() {
        if chunk.len() >= FRAME_OVERHEAD && bool::from(chunk[..MARKER_LEN].ct_eq(user_uuid)) {
            chunk.advance(MARKER_LEN);
            state.remaining_command = HEADER_LEN as i32;
        } else {
            return chunk;
        }
    }

    let mut output = BytesMut::with_capacity(chunk.len());

    while !chunk.is_empty() {
        if state.remaining_command > 0 {
            let byte = chunk.get_u8();
            match state.remaining_command {
                5 => state.current_command = byte,
                4 => state.remaining_content = (byte as i32) << 8,
                3 => state.remaining_content |= byte as i32,
                2 => state.remaining_padding = (byte as i32) << 8,
                _ => state.remaining_padding |= byte as i32,
            }
            state.remaining_command -= 1;
        } else if state.remaining_content > 0 {
            let len = (state.remaining_content as usize).min(chunk.len());
            output.extend_from_slice(&chunk.split_to(len));
            state.remaining_content -= len as i32;
        } else {
            let len = (state.remaining_padding.max(0) as usize).min(chunk.len());
            chunk.advance(len);
            state.remaining_padding -= len as i32;
        }

        if state.at_block_boundary() {
            if state.current_command == 0 {
                state.remaining_command = HEADER_LEN as i32;
            } else {
                state.reset_cursors();
                if !chunk.is_empty() {
                    output.extend_from_slice(&chunk);
                }
                break;
            }
        }
    }

    output
}
