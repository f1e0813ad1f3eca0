//! Chunk model used by the Vision engines.
//!
//! A chunk is a `BytesMut` holding at most [`BUFFER_SIZE`] bytes: the amount a single
//! transport read produces and the amount a single padding frame must fit into. A
//! [`MultiBuffer`] is an ordered batch of chunks that travels through the pipeline as one
//! unit. Chunks are owned; passing one to an engine hands it over and the engine drops it
//! when done.

use bytes::BytesMut;

/// Capacity of one transport chunk.
pub const BUFFER_SIZE: usize = 8192;

pub type MultiBuffer = Vec<BytesMut>;

/// Total number of bytes across all chunks.
pub fn multi_len(mb: &[BytesMut]) -> usize {
    mb.iter().map(|chunk| chunk.len()).sum()
}

/// Splits `data` into chunks of at most [`BUFFER_SIZE`] bytes.
pub fn split_into_chunks(data: &[u8]) -> MultiBuffer {
    data.chunks(BUFFER_SIZE).map(BytesMut::from).collect()
}

/// Appends the contents of every chunk to `out`, releasing the chunks.
pub fn drain_multi_into(mb: MultiBuffer, out: &mut BytesMut) {
    for chunk in mb {
        out.extend_from_slice(&chunk);
    }
}
