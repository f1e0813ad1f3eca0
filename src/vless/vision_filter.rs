use bytes::BytesMut;
use memchr::memmem;

use super::traffic_state::TlsState;
use crate::buf_reader::BufReader;

// TLS handshake types
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const TLS_HANDSHAKE_TYPE_SERVER_HELLO: u8 = 0x02;

pub const TLS_CLIENT_HANDSHAKE_START: [u8; 2] = [0x16, 0x03];
pub const TLS_SERVER_HANDSHAKE_START: [u8; 3] = [0x16, 0x03, 0x03];

/// supported_versions extension carrying only TLS 1.3, as sent in a TLS 1.3 ServerHello.
pub const TLS13_SUPPORTED_VERSIONS: [u8; 6] = [0x00, 0x2b, 0x00, 0x02, 0x03, 0x04];

/// Offset of the session id length byte in a ServerHello record.
const SERVER_HELLO_SESSION_ID_OFFSET: usize = 43;
const SERVER_HELLO_MIN_LEN: usize = 79;

pub const TLS13_CIPHER_AES_128_CCM_8_SHA256: u16 = 0x1305;

pub fn tls13_cipher_name(cipher: u16) -> Option<&'static str> {
    match cipher {
        0x1301 => Some("TLS_AES_128_GCM_SHA256"),
        0x1302 => Some("TLS_AES_256_GCM_SHA384"),
        0x1303 => Some("TLS_CHACHA20_POLY1305_SHA256"),
        0x1304 => Some("TLS_AES_128_CCM_SHA256"),
        TLS13_CIPHER_AES_128_CCM_8_SHA256 => Some("TLS_AES_128_CCM_8_SHA256"),
        _ => None,
    }
}

fn read_server_hello_cipher(data: &[u8]) -> std::io::Result<u16> {
    let mut reader = BufReader::new(data);
    reader.skip(SERVER_HELLO_SESSION_ID_OFFSET)?;
    let session_id_len = reader.read_u8()? as usize;
    reader.skip(session_id_len)?;
    reader.read_u16_be()
}

/// Inspects a batch of chunks for TLS handshake patterns, updating `state`.
///
/// Every non-empty chunk uses up one filter slot. Filtering stops as soon as the ServerHello
/// reveals the negotiated version.
pub fn filter_tls(mb: &[BytesMut], state: &mut TlsState) {
    for chunk in mb.iter().filter(|chunk| !chunk.is_empty()) {
        state.packets_to_filter = state.packets_to_filter.saturating_sub(1);

        if chunk.len() >= 6 {
            if chunk[..3] == TLS_SERVER_HANDSHAKE_START
                && chunk[5] == TLS_HANDSHAKE_TYPE_SERVER_HELLO
            {
                state.remaining_server_hello = u16::from_be_bytes([chunk[3], chunk[4]]) as i32 + 5;
                state.is_tls12_or_above = true;
                state.is_tls = true;
                if chunk.len() >= SERVER_HELLO_MIN_LEN
                    && state.remaining_server_hello >= SERVER_HELLO_MIN_LEN as i32
                {
                    match read_server_hello_cipher(chunk) {
                        Ok(cipher) => state.cipher = cipher,
                        Err(e) => {
                            log::debug!("VISION FILTER: failed to read server hello cipher: {}", e)
                        }
                    }
                } else {
                    log::info!(
                        "VISION FILTER: short server hello, tls 1.2 or older? {} {}",
                        chunk.len(),
                        state.remaining_server_hello
                    );
                }
            } else if chunk[..2] == TLS_CLIENT_HANDSHAKE_START
                && chunk[5] == TLS_HANDSHAKE_TYPE_CLIENT_HELLO
            {
                state.is_tls = true;
                log::info!("VISION FILTER: found tls client hello, {} bytes", chunk.len());
            }
        }

        if state.remaining_server_hello > 0 {
            let end = (state.remaining_server_hello as usize).min(chunk.len());
            state.remaining_server_hello -= chunk.len() as i32;

            if memmem::find(&chunk[..end], &TLS13_SUPPORTED_VERSIONS).is_some() {
                let name = tls13_cipher_name(state.cipher);
                if state.cipher != TLS13_CIPHER_AES_128_CCM_8_SHA256 {
                    state.enable_xtls = true;
                }
                log::info!(
                    "VISION FILTER: found tls 1.3, cipher {:#06x} ({}), xtls {}",
                    state.cipher,
                    name.unwrap_or("unknown"),
                    state.enable_xtls
                );
                state.stop_filtering("tls 1.3 server hello");
                return;
            } else if state.remaining_server_hello <= 0 {
                log::info!("VISION FILTER: found tls 1.2, {} bytes", chunk.len());
                state.stop_filtering("tls 1.2 server hello");
                return;
            }
            log::debug!(
                "VISION FILTER: inconclusive server hello {} {}",
                chunk.len(),
                state.remaining_server_hello
            );
        }

        if !state.is_filtering() {
            log::debug!("VISION FILTER: filter window exhausted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ServerHello record with `leading_ext_len` filler bytes before the optional
    /// supported_versions extension, followed by 24 trailing bytes.
    fn server_hello(cipher: u16, leading_ext_len: usize, tls13: bool) -> Vec<u8> {
        let mut body = vec![TLS_HANDSHAKE_TYPE_SERVER_HELLO, 0, 0, 0, 0x03, 0x03];
        body.extend_from_slice(&[0x11; 32]);
        body.push(0);
        body.extend_from_slice(&cipher.to_be_bytes());
        body.push(0);

        let mut extensions = vec![0u8; leading_ext_len];
        if tls13 {
            extensions.extend_from_slice(&TLS13_SUPPORTED_VERSIONS);
        }
        extensions.extend_from_slice(&[0u8; 24]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let handshake_len = (body.len() - 4) as u32;
        body[1..4].copy_from_slice(&handshake_len.to_be_bytes()[1..]);

        let mut record = TLS_SERVER_HANDSHAKE_START.to_vec();
        record.extend_from_slice(&(body.len() as u16).to_be_bytes());
        record.extend_from_slice(&body);
        record
    }

    fn chunks(parts: &[&[u8]]) -> Vec<BytesMut> {
        parts.iter().map(|part| BytesMut::from(*part)).collect()
    }

    #[test]
    fn test_tls13_server_hello_enables_xtls() {
        let data = server_hello(0x1301, 0, true);
        assert_eq!(data.len(), 79);
        assert_eq!(&data[3..5], &[0, 74]);

        let mut state = TlsState::new(8);
        filter_tls(&chunks(&[&data[..]]), &mut state);
        assert!(state.is_tls);
        assert!(state.is_tls12_or_above);
        assert_eq!(state.cipher, 0x1301);
        assert!(state.enable_xtls);
        assert_eq!(state.packets_to_filter, 0);
    }

    #[test]
    fn test_ccm8_cipher_does_not_enable_xtls() {
        let data = server_hello(TLS13_CIPHER_AES_128_CCM_8_SHA256, 0, true);
        let mut state = TlsState::new(8);
        filter_tls(&chunks(&[&data[..]]), &mut state);
        assert_eq!(state.cipher, TLS13_CIPHER_AES_128_CCM_8_SHA256);
        assert!(!state.enable_xtls);
        assert_eq!(state.packets_to_filter, 0);
    }

    #[test]
    fn test_unknown_tls13_cipher_enables_xtls() {
        let data = server_hello(0x13ff, 0, true);
        let mut state = TlsState::new(8);
        filter_tls(&chunks(&[&data[..]]), &mut state);
        assert!(tls13_cipher_name(0x13ff).is_none());
        assert!(state.enable_xtls);
    }

    #[test]
    fn test_tls12_server_hello_stops_filtering() {
        let data = server_hello(0xc02f, 10, false);
        let mut state = TlsState::new(8);
        filter_tls(&chunks(&[&data[..]]), &mut state);
        assert!(state.is_tls12_or_above);
        assert!(!state.enable_xtls);
        assert_eq!(state.packets_to_filter, 0);
        assert!(state.remaining_server_hello <= 0);
    }

    #[test]
    fn test_server_hello_spanning_chunks() {
        let data = server_hello(0x1302, 100, true);
        let (first, second) = data.split_at(100);

        let mut state = TlsState::new(8);
        filter_tls(&chunks(&[first]), &mut state);
        assert_eq!(state.cipher, 0x1302);
        assert!(!state.enable_xtls);
        assert_eq!(state.packets_to_filter, 7);
        assert_eq!(state.remaining_server_hello, (data.len() - 100) as i32);

        filter_tls(&chunks(&[second]), &mut state);
        assert!(state.enable_xtls);
        assert_eq!(state.packets_to_filter, 0);
    }

    #[test]
    fn test_client_hello_only_marks_tls() {
        let client_hello = [0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc];
        let mut state = TlsState::new(8);
        filter_tls(&chunks(&[&client_hello[..]]), &mut state);
        assert!(state.is_tls);
        assert!(!state.is_tls12_or_above);
        assert_eq!(state.remaining_server_hello, -1);
        assert_eq!(state.packets_to_filter, 7);
    }

    #[test]
    fn test_counts_each_non_empty_chunk() {
        let mut state = TlsState::new(3);
        filter_tls(&chunks(&[&b"abc"[..], &b""[..], &b"defghij"[..]]), &mut state);
        assert_eq!(state.packets_to_filter, 1);
        assert!(!state.is_tls);

        filter_tls(&chunks(&[&b"x"[..], &b"y"[..]]), &mut state);
        assert_eq!(state.packets_to_filter, 0);
    }

    #[test]
    fn test_oversized_session_id_is_ignored() {
        let mut data = server_hello(0x1301, 0, true);
        data[43] = 0xff;
        let mut state = TlsState::new(8);
        filter_tls(&chunks(&[&data[..]]), &mut state);
        assert_eq!(state.cipher, 0);
        assert!(state.is_tls12_or_above);
    }
}
