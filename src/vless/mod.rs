// VLESS XTLS Vision flow

pub mod traffic_state;
pub mod vision_filter;
pub mod vision_pad;
pub mod vision_reader;
pub mod vision_stream;
pub mod vision_unpad;
pub mod vision_writer;
pub mod vless_util;

pub use traffic_state::{DirectionState, PaddingCommand, TlsState, TrafficState};
pub use vision_reader::VisionReader;
pub use vision_stream::VisionStream;
pub use vision_writer::VisionWriter;
pub use vless_util::{vision_enabled, Addons, RequestCommand, RequestHeader, XTLS_VISION_FLOW};
