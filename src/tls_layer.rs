//! rustls transport layer.
//!
//! Unlike a plain TLS stream, this layer deframes the outer records itself and hands rustls one
//! record at a time, only when the plaintext of the previous one was fully read. Bytes after
//! the last record Vision consumed therefore stay untouched, either as undelivered plaintext or
//! as raw bytes in the deframer, and are returned by [`VisionConn::take_buffered_input`] when
//! the peer switches to direct copy.

use std::io::{self, Cursor, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::ready;
use rustls::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::conn::{BufferedInput, ConnLayer, VisionConn, TLS13_VERSION};
use crate::tls_deframer::{TlsDeframer, TLS_MAX_RECORD_SIZE};

/// Presents an async writer as a `std::io::Write` for `rustls::Connection::write_tls`,
/// mapping `Pending` to `WouldBlock`.
struct SyncWriter<'a, 'b, T> {
    io: &'a mut T,
    cx: &'a mut Context<'b>,
}

impl<T: AsyncWrite + Unpin> Write for SyncWriter<'_, '_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match Pin::new(&mut *self.io).poll_write(self.cx, buf) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match Pin::new(&mut *self.io).poll_flush(self.cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

fn tls_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("tls error: {e}"))
}

fn wire_version(version: ProtocolVersion) -> Option<u16> {
    match version {
        ProtocolVersion::TLSv1_3 => Some(TLS13_VERSION),
        ProtocolVersion::TLSv1_2 => Some(0x0303),
        ProtocolVersion::TLSv1_1 => Some(0x0302),
        ProtocolVersion::TLSv1_0 => Some(0x0301),
        _ => None,
    }
}

pub struct TlsLayer<IO> {
    io: IO,
    session: rustls::Connection,
    deframer: TlsDeframer,
    read_buffer: Box<[u8]>,
    sent_close_notify: bool,
}

impl<IO: VisionConn> TlsLayer<IO> {
    pub fn new(io: IO, session: impl Into<rustls::Connection>) -> Self {
        Self {
            io,
            session: session.into(),
            deframer: TlsDeframer::new(),
            read_buffer: vec![0u8; TLS_MAX_RECORD_SIZE].into_boxed_slice(),
            sent_close_notify: false,
        }
    }

    pub fn session(&self) -> &rustls::Connection {
        &self.session
    }

    pub async fn handshake(&mut self) -> io::Result<()> {
        while self.session.is_handshaking() {
            self.write_pending_tls().await?;
            if !self.session.is_handshaking() {
                break;
            }
            self.read_record().await?;
        }
        // client finished, or anything queued by the last record
        self.write_pending_tls().await?;

        log::debug!(
            "TLS handshake complete: {:?} {:?}",
            self.session.protocol_version(),
            self.session.negotiated_cipher_suite().map(|s| s.suite())
        );
        Ok(())
    }

    async fn write_pending_tls(&mut self) -> io::Result<()> {
        if !self.session.wants_write() {
            return Ok(());
        }
        let mut out = Vec::new();
        while self.session.wants_write() {
            self.session.write_tls(&mut out)?;
        }
        self.io.write_all(&out).await?;
        self.io.flush().await
    }

    async fn read_record(&mut self) -> io::Result<()> {
        loop {
            if let Some(record) = self.deframer.next_record()? {
                return self.feed_record(&record);
            }
            let n = self.io.read(&mut self.read_buffer).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF during TLS handshake",
                ));
            }
            self.deframer.feed(&self.read_buffer[..n]);
        }
    }

    fn feed_record(&mut self, record: &[u8]) -> io::Result<()> {
        let mut cursor = Cursor::new(record);
        while (cursor.position() as usize) < record.len() {
            let n = self.session.read_tls(&mut cursor)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "rustls did not consume the TLS record",
                ));
            }
        }
        self.session.process_new_packets().map_err(tls_error)?;
        Ok(())
    }

    fn poll_write_tls(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.session.wants_write() {
            let mut writer = SyncWriter {
                io: &mut self.io,
                cx: &mut *cx,
            };
            match self.session.write_tls(&mut writer) {
                Ok(0) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<IO: VisionConn> AsyncRead for TlsLayer<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.session.reader().read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Poll::Ready(Err(e)),
            }

            // plaintext is drained, decrypt exactly one more record
            if let Some(record) = this.deframer.next_record()? {
                this.feed_record(&record)?;
                // post-handshake messages may have queued a reply
                if let Poll::Ready(Err(e)) = this.poll_write_tls(cx) {
                    return Poll::Ready(Err(e));
                }
                continue;
            }

            let mut read_buf = ReadBuf::new(&mut this.read_buffer);
            ready!(Pin::new(&mut this.io).poll_read(cx, &mut read_buf))?;
            let n = read_buf.filled().len();
            if n == 0 {
                if this.deframer.pending_bytes() > 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "EOF in the middle of a TLS record",
                    )));
                }
                return Poll::Ready(Ok(()));
            }
            this.deframer.feed(&this.read_buffer[..n]);
        }
    }
}

impl<IO: VisionConn> AsyncWrite for TlsLayer<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_write_tls(cx))?;
        let n = this.session.writer().write(buf)?;
        if let Poll::Ready(Err(e)) = this.poll_write_tls(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_tls(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.sent_close_notify {
            this.session.send_close_notify();
            this.sent_close_notify = true;
        }
        ready!(this.poll_write_tls(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

impl<IO: VisionConn> VisionConn for TlsLayer<IO> {
    fn layer(&self) -> ConnLayer {
        ConnLayer::Tls
    }

    fn inner_conn(&mut self) -> &mut dyn VisionConn {
        &mut self.io
    }

    fn take_buffered_input(&mut self) -> BufferedInput {
        let mut input = BytesMut::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.session.reader().read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => input.extend_from_slice(&chunk[..n]),
            }
        }
        BufferedInput {
            input,
            raw_input: self.deframer.take_remaining(),
        }
    }

    fn negotiated_tls_version(&self) -> Option<u16> {
        self.session.protocol_version().and_then(wire_version)
    }
}
