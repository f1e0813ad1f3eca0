use bytes::{BufMut, BytesMut};
use memchr::memmem;
use rand::Rng;

use super::traffic_state::PaddingCommand;
use crate::buf::{MultiBuffer, BUFFER_SIZE};

pub const MARKER_LEN: usize = 16;
pub const HEADER_LEN: usize = 5;
/// Marker slot plus header. Reserved in every frame, even those without a marker.
pub const FRAME_OVERHEAD: usize = MARKER_LEN + HEADER_LEN;

/// Largest content that still fits in one chunk after framing.
pub const MAX_CONTENT_LEN: usize = BUFFER_SIZE - FRAME_OVERHEAD;

pub const TLS_APPLICATION_DATA_START: [u8; 3] = [0x17, 0x03, 0x03];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingSeed {
    /// Content shorter than this gets long padding when requested.
    pub long_threshold: u32,
    pub long_range: u32,
    /// Long padding brings content plus padding to at least this many bytes.
    pub long_target: u32,
    pub short_range: u32,
}

impl Default for PaddingSeed {
    fn default() -> Self {
        Self::from([900, 500, 900, 256])
    }
}

impl From<[u32; 4]> for PaddingSeed {
    fn from(seed: [u32; 4]) -> Self {
        Self {
            long_threshold: seed[0],
            long_range: seed[1],
            long_target: seed[2],
            short_range: seed[3],
        }
    }
}

fn random_below(rng: &mut impl Rng, bound: u32) -> usize {
    if bound == 0 {
        0
    } else {
        rng.random_range(0..bound) as usize
    }
}

/// Padding length for a frame carrying `content_len` bytes, clamped so the frame fits one
/// chunk.
pub fn padding_length(content_len: usize, long_padding: bool, seed: &PaddingSeed) -> usize {
    let mut rng = rand::rng();
    let padding_len = if content_len < seed.long_threshold as usize && long_padding {
        (random_below(&mut rng, seed.long_range) + seed.long_target as usize)
            .saturating_sub(content_len)
    } else {
        random_below(&mut rng, seed.short_range)
    };
    padding_len.min(MAX_CONTENT_LEN.saturating_sub(content_len))
}

/// Builds one padding frame around `content`.
///
/// `user_uuid` is taken on the first call, so only the first frame of a direction carries
/// the marker. A `None` content produces a frame of pure padding.
pub fn pad(
    content: Option<BytesMut>,
    command: PaddingCommand,
    user_uuid: &mut Option<[u8; 16]>,
    long_padding: bool,
    seed: &PaddingSeed,
) -> BytesMut {
    let content_len = content.as_ref().map_or(0, |c| c.len());
    let padding_len = padding_length(content_len, long_padding, seed);

    let mut output = BytesMut::with_capacity(FRAME_OVERHEAD + content_len + padding_len);
    if let Some(uuid) = user_uuid.take() {
        output.put_slice(&uuid);
    }
    output.put_u8(command as u8);
    output.put_u16(content_len as u16);
    output.put_u16(padding_len as u16);
    if let Some(content) = content {
        output.put_slice(&content);
    }

    if padding_len > 0 {
        let padding_start = output.len();
        output.resize(padding_start + padding_len, 0);
        rand::rng().fill(&mut output[padding_start..]);
    }

    log::debug!(
        "VISION WRITE: padded frame command={:?} content={} padding={}",
        command,
        content_len,
        padding_len
    );
    output
}

/// Splits every chunk too large to be framed into pieces of at most [`MAX_CONTENT_LEN`].
///
/// The split point is the last TLS application data record start when it leaves room on
/// both sides, else the middle of the chunk.
pub fn reshape_multi_buffer(mb: MultiBuffer) -> MultiBuffer {
    if mb.iter().all(|chunk| chunk.len() < MAX_CONTENT_LEN) {
        return mb;
    }

    let mut reshaped = Vec::with_capacity(mb.len() + 1);
    for mut chunk in mb {
        let mut needs_split = chunk.len() >= MAX_CONTENT_LEN;
        while needs_split {
            let window = chunk.len().min(BUFFER_SIZE);
            let index = match memmem::rfind(&chunk[..window], &TLS_APPLICATION_DATA_START) {
                Some(index) if (FRAME_OVERHEAD..=MAX_CONTENT_LEN).contains(&index) => index,
                _ => window / 2,
            };
            reshaped.push(chunk.split_to(index));
            needs_split = chunk.len() > MAX_CONTENT_LEN;
        }
        reshaped.push(chunk);
    }
    reshaped
}

/// True when the batch is a run of whole TLS application data records.
pub fn is_complete_record(mb: &[BytesMut]) -> bool {
    let mut bytes = mb.iter().flat_map(|chunk| chunk.iter().copied());
    loop {
        let Some(first) = bytes.next() else {
            return true;
        };
        if first != TLS_APPLICATION_DATA_START[0]
            || bytes.next() != Some(TLS_APPLICATION_DATA_START[1])
            || bytes.next() != Some(TLS_APPLICATION_DATA_START[2])
        {
            return false;
        }
        let (Some(high), Some(low)) = (bytes.next(), bytes.next()) else {
            return false;
        };
        let record_len = u16::from_be_bytes([high, low]) as usize;
        if record_len == 0 || bytes.nth(record_len - 1).is_none() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vless::traffic_state::DirectionState;
    use crate::vless::vision_unpad::unpad;

    const UUID: [u8; 16] = [7u8; 16];

    fn record(len: usize) -> Vec<u8> {
        let mut out = TLS_APPLICATION_DATA_START.to_vec();
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend(std::iter::repeat(0xab).take(len));
        out
    }

    #[test]
    fn test_first_frame_carries_marker_once() {
        let seed = PaddingSeed::default();
        let mut uuid = Some(UUID);
        let first = pad(
            Some(BytesMut::from(&b"hello"[..])),
            PaddingCommand::Continue,
            &mut uuid,
            false,
            &seed,
        );
        assert_eq!(&first[..16], &UUID);
        assert_eq!(first[16], 0);
        assert_eq!(&first[17..19], &[0, 5]);
        assert_eq!(&first[21..26], b"hello");
        assert!(uuid.is_none());

        let second = pad(
            Some(BytesMut::from(&b"again"[..])),
            PaddingCommand::End,
            &mut uuid,
            false,
            &seed,
        );
        assert_eq!(second[0], 1);
        assert_eq!(&second[1..3], &[0, 5]);
        assert_eq!(&second[5..10], b"again");
        assert!(memmem::find(&second, &UUID).is_none());
    }

    #[test]
    fn test_empty_long_padding_range() {
        let seed = PaddingSeed::default();
        for _ in 0..200 {
            let mut uuid = None;
            let frame = pad(None, PaddingCommand::Continue, &mut uuid, true, &seed);
            let content_len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
            let padding_len = u16::from_be_bytes([frame[3], frame[4]]) as usize;
            assert_eq!(content_len, 0);
            assert!((900..1400).contains(&padding_len), "{padding_len}");
            assert_eq!(frame.len(), HEADER_LEN + padding_len);
        }
    }

    #[test]
    fn test_short_padding_range() {
        let seed = PaddingSeed::default();
        for _ in 0..200 {
            assert!(padding_length(100, false, &seed) < 256);
            // content above the long threshold always uses short padding
            assert!(padding_length(1000, true, &seed) < 256);
        }
    }

    #[test]
    fn test_padding_clamped_to_chunk() {
        let seed = PaddingSeed::default();
        for _ in 0..50 {
            assert_eq!(padding_length(MAX_CONTENT_LEN, false, &seed), 0);
            assert!(padding_length(MAX_CONTENT_LEN - 10, false, &seed) <= 10);
        }
        let seed = PaddingSeed::from([9000, 1, 8171, 1]);
        assert_eq!(padding_length(100, true, &seed), MAX_CONTENT_LEN - 100);
    }

    #[test]
    fn test_pad_unpad_roundtrip_with_all_commands() {
        let seed = PaddingSeed::default();
        let mut uuid = Some(UUID);
        let payloads: [&[u8]; 3] = [b"first", b"", b"third part"];
        let commands = [
            PaddingCommand::Continue,
            PaddingCommand::Continue,
            PaddingCommand::Direct,
        ];

        let mut wire = Vec::new();
        for (payload, command) in payloads.iter().zip(commands) {
            let content = if payload.is_empty() {
                None
            } else {
                Some(BytesMut::from(*payload))
            };
            wire.extend_from_slice(&pad(content, command, &mut uuid, true, &seed));
        }

        let mut state = DirectionState::new();
        let mut out = Vec::new();
        for piece in wire.chunks(97) {
            out.extend_from_slice(&unpad(BytesMut::from(piece), &UUID, &mut state));
        }
        assert_eq!(out, b"firstthird part");
        assert_eq!(state.current_command, PaddingCommand::Direct as u8);
    }

    #[test]
    fn test_reshape_leaves_small_chunks() {
        let mb = vec![BytesMut::from(&[1u8; 100][..]), BytesMut::from(&[2u8; 8170][..])];
        let reshaped = reshape_multi_buffer(mb);
        assert_eq!(reshaped.len(), 2);
        assert_eq!(reshaped[1].len(), 8170);
    }

    #[test]
    fn test_reshape_splits_at_last_record_start() {
        let mut data = record(5000);
        data.extend(record(3180));
        assert_eq!(data.len(), 8190);
        let reshaped = reshape_multi_buffer(vec![BytesMut::from(&data[..])]);
        assert_eq!(reshaped.len(), 2);
        assert_eq!(reshaped[0].len(), 5005);
        assert_eq!(&reshaped[1][..3], &TLS_APPLICATION_DATA_START);
    }

    #[test]
    fn test_reshape_splits_at_midpoint_without_marker() {
        for len in [MAX_CONTENT_LEN, BUFFER_SIZE] {
            let reshaped = reshape_multi_buffer(vec![BytesMut::from(&vec![0u8; len][..])]);
            assert_eq!(reshaped.len(), 2);
            assert_eq!(reshaped[0].len(), len / 2);
            assert_eq!(reshaped[0].len() + reshaped[1].len(), len);
            for piece in &reshaped {
                assert!(piece.len() + FRAME_OVERHEAD <= BUFFER_SIZE);
            }
        }
    }

    #[test]
    fn test_reshape_ignores_marker_too_close_to_start() {
        let mut data = vec![0u8; BUFFER_SIZE];
        data[10..13].copy_from_slice(&TLS_APPLICATION_DATA_START);
        let reshaped = reshape_multi_buffer(vec![BytesMut::from(&data[..])]);
        assert_eq!(reshaped[0].len(), BUFFER_SIZE / 2);
    }

    #[test]
    fn test_reshape_oversize_chunk_repeatedly() {
        let reshaped = reshape_multi_buffer(vec![BytesMut::from(&vec![0u8; 20000][..])]);
        assert!(reshaped.len() > 2);
        assert_eq!(reshaped.iter().map(|c| c.len()).sum::<usize>(), 20000);
        assert!(reshaped.iter().all(|c| c.len() <= MAX_CONTENT_LEN));
    }

    #[test]
    fn test_is_complete_record() {
        let mut two = record(10);
        two.extend(record(20));
        assert!(is_complete_record(&[BytesMut::from(&two[..])]));

        // records may span chunks
        let (a, b) = two.split_at(7);
        assert!(is_complete_record(&[BytesMut::from(a), BytesMut::from(b)]));

        let truncated = &two[..two.len() - 1];
        assert!(!is_complete_record(&[BytesMut::from(truncated)]));

        let mut handshake = record(4);
        handshake[0] = 0x16;
        assert!(!is_complete_record(&[BytesMut::from(&handshake[..])]));

        assert!(!is_complete_record(&[BytesMut::from(&record(0)[..])]));
    }
}
