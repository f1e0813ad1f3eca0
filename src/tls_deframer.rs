use bytes::{Bytes, BytesMut};
use std::io;

const TLS_RECORD_HEADER_SIZE: usize = 5;

/// TLS 1.2 ciphertext limit: 2^14 plaintext plus 2048 bytes of expansion. Also covers 1.3.
const MAX_TLS_CIPHERTEXT_LEN: usize = 16384 + 2048;

pub const TLS_MAX_RECORD_SIZE: usize = MAX_TLS_CIPHERTEXT_LEN + TLS_RECORD_HEADER_SIZE;

/// Splits an outer TLS byte stream into whole records.
///
/// Bytes are only consumed one record at a time, so whatever has not been handed out yet can
/// be recovered untouched with [`TlsDeframer::take_remaining`].
#[derive(Debug)]
pub struct TlsDeframer {
    buffer: BytesMut,
}

impl Default for TlsDeframer {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsDeframer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(TLS_MAX_RECORD_SIZE),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete record including its header, or None if more bytes are needed.
    pub fn next_record(&mut self) -> io::Result<Option<Bytes>> {
        if self.buffer.len() < TLS_RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let content_type = self.buffer[0];
        let version = u16::from_be_bytes([self.buffer[1], self.buffer[2]]);
        let payload_len = u16::from_be_bytes([self.buffer[3], self.buffer[4]]) as usize;

        // record layer versions run from TLS 1.0 to 1.2, 1.3 records claim 1.2
        if !(0x0301..=0x0303).contains(&version) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid TLS record version: {version:#06x}"),
            ));
        }
        if !(0x14..=0x18).contains(&content_type) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid TLS content type: {content_type:#04x}"),
            ));
        }
        if payload_len > MAX_TLS_CIPHERTEXT_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "TLS record length {} exceeds maximum {}",
                    payload_len, MAX_TLS_CIPHERTEXT_LEN
                ),
            ));
        }

        let total_len = TLS_RECORD_HEADER_SIZE + payload_len;
        if self.buffer.len() < total_len {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(total_len).freeze()))
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Takes every byte not yet returned as a record, including a partial record.
    pub fn take_remaining(&mut self) -> BytesMut {
        self.buffer.split()
    }
}
