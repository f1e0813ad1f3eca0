use std::io;

use serde::Deserialize;

use crate::buf::BUFFER_SIZE;
use crate::vless::vision_pad::{PaddingSeed, FRAME_OVERHEAD};

fn default_padding_seed() -> [u32; 4] {
    [900, 500, 900, 256]
}

fn default_packets_to_filter() -> u32 {
    8
}

/// Tunables for the Vision flow.
///
/// ```yaml
/// padding_seed: [900, 500, 900, 256]
/// packets_to_filter: 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VisionConfig {
    /// `[long padding threshold, long padding random range, long padding target,
    /// short padding random range]`
    #[serde(default = "default_padding_seed")]
    pub padding_seed: [u32; 4],

    /// Number of chunks inspected for TLS handshake patterns before filtering gives up.
    #[serde(default = "default_packets_to_filter")]
    pub packets_to_filter: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            padding_seed: default_padding_seed(),
            packets_to_filter: default_packets_to_filter(),
        }
    }
}

impl VisionConfig {
    pub fn from_yaml_str(s: &str) -> io::Result<Self> {
        let config: VisionConfig = serde_yaml::from_str(s).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to parse vision config: {e}"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> io::Result<()> {
        if self.padding_seed[1] == 0 || self.padding_seed[3] == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "padding seed random ranges must be non-zero: {:?}",
                    self.padding_seed
                ),
            ));
        }
        let max_target = (BUFFER_SIZE - FRAME_OVERHEAD) as u32;
        if self.padding_seed[2] > max_target {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "long padding target {} exceeds {}",
                    self.padding_seed[2], max_target
                ),
            ));
        }
        Ok(())
    }

    pub fn padding_seed(&self) -> PaddingSeed {
        PaddingSeed::from(self.padding_seed)
    }
}
