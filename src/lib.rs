//! vless-vision - the VLESS XTLS Vision flow.
//!
//! Vision hides the TLS handshake of proxied traffic inside padded frames, watches the inner
//! handshake for TLS 1.3, and once the inner connection carries application data it stops
//! framing and copies bytes straight to the socket under the outer security layer.
//!
//! The engines in [`vless`] are pure transforms over chunk lists. [`vless::VisionStream`]
//! drives them over any connection stack described through [`conn::VisionConn`], such as
//! [`tls_layer::TlsLayer`] on a TCP socket.

pub mod buf;
pub mod buf_reader;
pub mod config;
pub mod conn;
pub mod stats;
pub mod tls_deframer;
pub mod tls_layer;
pub mod vless;

pub use config::VisionConfig;
pub use conn::{ConnLayer, StatsConn, VisionConn};
pub use tls_layer::TlsLayer;
pub use vless::{vision_enabled, VisionStream};
