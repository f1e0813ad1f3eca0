//! Layered connection model.
//!
//! A proxied connection is a stack of wrappers: byte counting, HTTP upgrade or WebSocket
//! framing, TLS or REALITY, PROXY protocol and finally a socket. Once Vision decides to copy
//! directly it needs the socket underneath the security layer, the counters of the stats
//! wrapper, and whatever the wrappers already buffered. Each wrapper describes itself through
//! [`VisionConn`] so the stack can be walked without knowing the concrete types.

use std::fmt::Debug;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::buf::{MultiBuffer, BUFFER_SIZE};
use crate::stats::Counter;

pub const TLS13_VERSION: u16 = 0x0304;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnLayer {
    Raw,
    Stats,
    HttpUpgrade,
    WebSocket,
    Tls,
    /// TLS client with a mimicked ClientHello.
    FingerprintedTls,
    RealityServer,
    RealityClient,
    ProxyProtocol,
    /// Never unwrapped: bypassing it would leave the bytes unobfuscated.
    RandomObfuscation,
}

impl ConnLayer {
    pub fn is_security(self) -> bool {
        matches!(
            self,
            ConnLayer::Tls
                | ConnLayer::FingerprintedTls
                | ConnLayer::RealityServer
                | ConnLayer::RealityClient
        )
    }

    fn unwrap_stage(self) -> Option<UnwrapStage> {
        match self {
            ConnLayer::Stats => Some(UnwrapStage::Stats),
            ConnLayer::HttpUpgrade | ConnLayer::WebSocket => Some(UnwrapStage::Upgrade),
            ConnLayer::ProxyProtocol => Some(UnwrapStage::ProxyProtocol),
            layer if layer.is_security() => Some(UnwrapStage::Security),
            _ => None,
        }
    }
}

// Layers are peeled in this order, at most one per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum UnwrapStage {
    Stats,
    Upgrade,
    Security,
    ProxyProtocol,
}

/// Bytes a wrapper received from below but has not handed to its reader yet.
#[derive(Debug, Default)]
pub struct BufferedInput {
    /// Decoded but undelivered bytes.
    pub input: BytesMut,
    /// Bytes read from the inner connection but not decoded yet.
    pub raw_input: BytesMut,
}

pub trait VisionConn: AsyncRead + AsyncWrite + Unpin + Send {
    fn layer(&self) -> ConnLayer {
        ConnLayer::Raw
    }

    /// The wrapped connection. Raw connections return themselves.
    fn inner_conn(&mut self) -> &mut dyn VisionConn;

    /// `(read, write)` counters of a stats wrapper.
    fn counters(&self) -> Option<(Arc<dyn Counter>, Arc<dyn Counter>)> {
        None
    }

    /// Takes the bytes this layer buffered. Called once, right before direct copy starts
    /// reading underneath it.
    fn take_buffered_input(&mut self) -> BufferedInput {
        BufferedInput::default()
    }

    /// Wire value of the negotiated TLS version, for TLS and REALITY layers.
    fn negotiated_tls_version(&self) -> Option<u16> {
        None
    }
}

impl VisionConn for tokio::net::TcpStream {
    fn inner_conn(&mut self) -> &mut dyn VisionConn {
        self
    }
}

#[cfg(unix)]
impl VisionConn for tokio::net::UnixStream {
    fn inner_conn(&mut self) -> &mut dyn VisionConn {
        self
    }
}

impl VisionConn for tokio::io::DuplexStream {
    fn inner_conn(&mut self) -> &mut dyn VisionConn {
        self
    }
}

impl VisionConn for Box<dyn VisionConn> {
    fn layer(&self) -> ConnLayer {
        (**self).layer()
    }

    fn inner_conn(&mut self) -> &mut dyn VisionConn {
        (**self).inner_conn()
    }

    fn counters(&self) -> Option<(Arc<dyn Counter>, Arc<dyn Counter>)> {
        (**self).counters()
    }

    fn take_buffered_input(&mut self) -> BufferedInput {
        (**self).take_buffered_input()
    }

    fn negotiated_tls_version(&self) -> Option<u16> {
        (**self).negotiated_tls_version()
    }
}

/// Counts the bytes passing through `inner`.
#[derive(Debug)]
pub struct StatsConn<C> {
    inner: C,
    read_counter: Arc<dyn Counter>,
    write_counter: Arc<dyn Counter>,
}

impl<C: VisionConn> StatsConn<C> {
    pub fn new(inner: C, read_counter: Arc<dyn Counter>, write_counter: Arc<dyn Counter>) -> Self {
        Self {
            inner,
            read_counter,
            write_counter,
        }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: VisionConn> AsyncRead for StatsConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n > 0 {
            this.read_counter.add(n as u64);
        }
        Poll::Ready(Ok(()))
    }
}

impl<C: VisionConn> AsyncWrite for StatsConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.write_counter.add(n as u64);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<C: VisionConn> VisionConn for StatsConn<C> {
    fn layer(&self) -> ConnLayer {
        ConnLayer::Stats
    }

    fn inner_conn(&mut self) -> &mut dyn VisionConn {
        &mut self.inner
    }

    fn counters(&self) -> Option<(Arc<dyn Counter>, Arc<dyn Counter>)> {
        Some((self.read_counter.clone(), self.write_counter.clone()))
    }
}

/// Innermost connection usable for direct copy.
pub struct RawConn<'a> {
    pub conn: &'a mut dyn VisionConn,
    pub read_counter: Option<Arc<dyn Counter>>,
    pub write_counter: Option<Arc<dyn Counter>>,
}

impl Debug for RawConn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConn")
            .field("layer", &self.conn.layer())
            .field("read_counter", &self.read_counter)
            .field("write_counter", &self.write_counter)
            .finish()
    }
}

/// Walks down the wrapper stack, calling `visit` on every layer before stepping under it.
fn peel<'a>(
    conn: &'a mut dyn VisionConn,
    mut visit: impl FnMut(ConnLayer, &mut dyn VisionConn),
) -> &'a mut dyn VisionConn {
    let mut current = conn;
    let mut next_stage = UnwrapStage::Stats;
    loop {
        let layer = current.layer();
        let stage = match layer.unwrap_stage() {
            Some(stage) if stage >= next_stage => stage,
            _ => return current,
        };
        visit(layer, &mut *current);
        current = current.inner_conn();
        next_stage = match stage {
            UnwrapStage::Stats => UnwrapStage::Upgrade,
            UnwrapStage::Upgrade => UnwrapStage::Security,
            UnwrapStage::Security => UnwrapStage::ProxyProtocol,
            UnwrapStage::ProxyProtocol => return current,
        };
    }
}

/// Finds the connection underneath every known wrapper, along with the counters of the stats
/// wrapper if there was one.
pub fn unwrap_raw(conn: &mut dyn VisionConn) -> RawConn<'_> {
    let mut counters = None;
    let conn = peel(conn, |layer, current| {
        if layer == ConnLayer::Stats {
            counters = current.counters();
        }
        log::debug!("VISION: unwrapping {:?} layer", layer);
    });
    let (read_counter, write_counter) = counters.unzip();
    RawConn {
        conn,
        read_counter,
        write_counter,
    }
}

fn push_chunks(mb: &mut MultiBuffer, mut bytes: BytesMut) {
    while !bytes.is_empty() {
        let len = bytes.len().min(BUFFER_SIZE);
        mb.push(bytes.split_to(len));
    }
}

/// Takes everything the wrappers above the raw connection buffered, outermost first.
pub fn drain_buffered_input(conn: &mut dyn VisionConn) -> MultiBuffer {
    let mut mb = MultiBuffer::new();
    peel(conn, |layer, current| {
        let BufferedInput { input, raw_input } = current.take_buffered_input();
        if !input.is_empty() || !raw_input.is_empty() {
            log::debug!(
                "VISION: recovered {} buffered and {} raw bytes from {:?} layer",
                input.len(),
                raw_input.len(),
                layer
            );
        }
        push_chunks(&mut mb, input);
        push_chunks(&mut mb, raw_input);
    });
    mb
}

/// Checks that the connection can carry Vision: the first layer under the stats and upgrade
/// wrappers must be TLS 1.3, REALITY or random obfuscation.
pub fn ensure_vision_transport(conn: &mut dyn VisionConn) -> io::Result<()> {
    let mut current = conn;
    loop {
        match current.layer() {
            ConnLayer::Stats | ConnLayer::HttpUpgrade | ConnLayer::WebSocket => {
                current = current.inner_conn();
            }
            ConnLayer::RandomObfuscation => return Ok(()),
            layer if layer.is_security() => {
                return match current.negotiated_tls_version() {
                    Some(TLS13_VERSION) => Ok(()),
                    version => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "failed to use xtls-rprx-vision, found outer tls version {:?} on {:?} layer",
                            version.map(|v| format!("{v:#06x}")),
                            layer
                        ),
                    )),
                };
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "XTLS only supports TLS and REALITY directly for now",
                ))
            }
        }
    }
}
