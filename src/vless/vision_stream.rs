//! Vision stream.
//!
//! Wraps a layered connection and runs the Vision engines over it: writes are framed and
//! reads unpadded until the respective direction switches to direct copy, after which that
//! direction reads or writes the connection found by [`unwrap_raw`], bypassing the security
//! layer. Each direction switches independently.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::traffic_state::TrafficState;
use super::vision_pad::PaddingSeed;
use super::vision_reader::VisionReader;
use super::vision_writer::VisionWriter;
use super::vless_util::{vision_enabled, RequestHeader, XTLS_VISION_FLOW};
use crate::buf::{drain_multi_into, split_into_chunks, BUFFER_SIZE};
use crate::config::VisionConfig;
use crate::conn::{drain_buffered_input, ensure_vision_transport, unwrap_raw, VisionConn};
use crate::stats::Counter;

pub struct VisionStream<C> {
    conn: C,
    traffic_state: Arc<TrafficState>,
    reader: VisionReader,
    writer: VisionWriter,

    read_buffer: Box<[u8]>,
    /// Payload decoded but not yet returned to the caller.
    pending_read: BytesMut,
    /// Framed bytes not yet accepted by the connection.
    pending_write: BytesMut,

    direct_read_counter: Option<Arc<dyn Counter>>,
    direct_write_counter: Option<Arc<dyn Counter>>,
    is_read_eof: bool,
}

impl<C: VisionConn> VisionStream<C> {
    /// Starts Vision on an established connection for the user `user_uuid`.
    ///
    /// Fails if the connection does not carry TLS 1.3, REALITY or random obfuscation.
    pub fn new(mut conn: C, user_uuid: [u8; 16], config: &VisionConfig) -> io::Result<Self> {
        config.validate()?;
        ensure_vision_transport(&mut conn)?;
        let traffic_state = Arc::new(TrafficState::with_packets_to_filter(
            user_uuid,
            config.packets_to_filter,
        ));
        Ok(Self::with_traffic_state(
            conn,
            traffic_state,
            config.padding_seed(),
        ))
    }

    /// Starts Vision for a decoded request, keyed on the requesting user.
    ///
    /// Fails if the request does not select the Vision flow.
    pub fn for_request(
        conn: C,
        header: &RequestHeader,
        config: &VisionConfig,
    ) -> io::Result<Self> {
        if !vision_enabled(header)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "request flow {:?} does not use {}",
                    header.addons.flow, XTLS_VISION_FLOW
                ),
            ));
        }
        Self::new(conn, header.user_id, config)
    }

    pub fn with_traffic_state(
        conn: C,
        traffic_state: Arc<TrafficState>,
        seed: PaddingSeed,
    ) -> Self {
        Self {
            conn,
            reader: VisionReader::new(traffic_state.clone()),
            writer: VisionWriter::new(traffic_state.clone(), seed),
            traffic_state,
            read_buffer: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            pending_read: BytesMut::new(),
            pending_write: BytesMut::new(),
            direct_read_counter: None,
            direct_write_counter: None,
            is_read_eof: false,
        }
    }

    pub fn traffic_state(&self) -> &Arc<TrafficState> {
        &self.traffic_state
    }

    pub fn is_read_direct(&self) -> bool {
        self.reader.is_direct_copy()
    }

    pub fn is_write_direct(&self) -> bool {
        self.writer.is_direct_copy()
    }

    /// Feeds bytes that were read off the connection together with the request header.
    pub fn feed_initial_read_data(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.process_read(BytesMut::from(data));
        }
    }

    /// Sends a frame of pure padding while padding is still required.
    pub async fn write_padding_heartbeat(&mut self) -> io::Result<()> {
        let Some(frame) = self.writer.frame_heartbeat() else {
            return Ok(());
        };
        self.pending_write.extend_from_slice(&frame);
        poll_fn(|cx| self.poll_write_pending(cx)).await?;
        poll_fn(|cx| Pin::new(&mut self.conn).poll_flush(cx)).await
    }

    fn process_read(&mut self, chunk: BytesMut) {
        let was_direct = self.reader.is_direct_copy();
        let mb = self.reader.process(vec![chunk]);
        drain_multi_into(mb, &mut self.pending_read);

        if !was_direct && self.reader.is_direct_copy() {
            let buffered = drain_buffered_input(&mut self.conn);
            drain_multi_into(buffered, &mut self.pending_read);
            self.direct_read_counter = unwrap_raw(&mut self.conn).read_counter;
            log::info!(
                "VISION READ: switched to direct copy, {} bytes pending",
                self.pending_read.len()
            );
        }
    }

    /// Completes a write-side switch raised by the direct command frame. Anything that
    /// reaches the outer layer after that frame would be delivered to the peer as payload.
    fn poll_finish_direct_switch(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.writer.pending_direct_switch() {
            ready!(Pin::new(&mut self.conn).poll_flush(cx))?;
            self.direct_write_counter = unwrap_raw(&mut self.conn).write_counter;
            self.writer.switch_to_direct_copy();
        }
        Poll::Ready(Ok(()))
    }

    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending_write.is_empty() {
            let n = ready!(Pin::new(&mut self.conn).poll_write(cx, &self.pending_write))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_write.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<C: VisionConn> AsyncRead for VisionStream<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending_read.is_empty() {
                let n = this.pending_read.len().min(buf.remaining());
                buf.put_slice(&this.pending_read.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.is_read_eof {
                return Poll::Ready(Ok(()));
            }

            if this.reader.is_direct_copy() {
                let raw = unwrap_raw(&mut this.conn);
                let before = buf.filled().len();
                ready!(Pin::new(raw.conn).poll_read(cx, buf))?;
                let n = buf.filled().len() - before;
                if let Some(counter) = &this.direct_read_counter {
                    counter.add(n as u64);
                }
                return Poll::Ready(Ok(()));
            }

            let mut read_buf = ReadBuf::new(&mut this.read_buffer);
            ready!(Pin::new(&mut this.conn).poll_read(cx, &mut read_buf))?;
            let n = read_buf.filled().len();
            if n == 0 {
                this.is_read_eof = true;
                continue;
            }
            let chunk = BytesMut::from(&this.read_buffer[..n]);
            this.process_read(chunk);
        }
    }
}

impl<C: VisionConn> AsyncWrite for VisionStream<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        ready!(this.poll_finish_direct_switch(cx))?;

        if this.writer.is_direct_copy() {
            let raw = unwrap_raw(&mut this.conn);
            let n = ready!(Pin::new(raw.conn).poll_write(cx, buf))?;
            if let Some(counter) = &this.direct_write_counter {
                counter.add(n as u64);
            }
            return Poll::Ready(Ok(n));
        }

        let framed = this.writer.frame(split_into_chunks(buf));
        drain_multi_into(framed, &mut this.pending_write);
        if let Poll::Ready(Err(e)) = this.poll_write_pending(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        ready!(this.poll_finish_direct_switch(cx))?;
        if this.writer.is_direct_copy() {
            Pin::new(unwrap_raw(&mut this.conn).conn).poll_flush(cx)
        } else {
            Pin::new(&mut this.conn).poll_flush(cx)
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        ready!(this.poll_finish_direct_switch(cx))?;
        if this.writer.is_direct_copy() {
            Pin::new(unwrap_raw(&mut this.conn).conn).poll_shutdown(cx)
        } else {
            Pin::new(&mut this.conn).poll_shutdown(cx)
        }
    }
}
