use std::sync::Arc;

use bytes::BytesMut;

use super::traffic_state::{DirectionState, PaddingCommand, TrafficState};
use super::vision_filter::filter_tls;
use super::vision_pad::{
    is_complete_record, pad, reshape_multi_buffer, PaddingSeed, TLS_APPLICATION_DATA_START,
};
use crate::buf::MultiBuffer;

/// Write-side Vision engine for one direction.
///
/// Frames outgoing payload while padding is required, and raises a pending switch once the
/// frame carrying [`PaddingCommand::Direct`] has been produced. The switch takes effect for
/// the batch after that frame, once the caller has flushed it through the outer transport.
#[derive(Debug)]
pub struct VisionWriter {
    traffic_state: Arc<TrafficState>,
    state: DirectionState,
    write_once_user_uuid: Option<[u8; 16]>,
    seed: PaddingSeed,
    pending_direct_copy: bool,
}

impl VisionWriter {
    pub fn new(traffic_state: Arc<TrafficState>, seed: PaddingSeed) -> Self {
        let write_once_user_uuid = Some(*traffic_state.user_uuid());
        Self {
            traffic_state,
            state: DirectionState::new(),
            write_once_user_uuid,
            seed,
            pending_direct_copy: false,
        }
    }

    pub fn state(&self) -> &DirectionState {
        &self.state
    }

    pub fn is_direct_copy(&self) -> bool {
        self.state.direct_copy
    }

    /// True once the direct command frame was produced and until the switch is made.
    pub fn pending_direct_switch(&self) -> bool {
        self.pending_direct_copy
    }

    pub fn switch_to_direct_copy(&mut self) {
        log::info!("VISION WRITE: switching to direct copy");
        self.pending_direct_copy = false;
        self.state.switch_to_direct_copy();
    }

    /// A pure padding frame, used to hide the shape of the request header when no payload is
    /// ready yet. None once padding is over.
    pub fn frame_heartbeat(&mut self) -> Option<BytesMut> {
        if !self.state.is_padding || self.state.direct_copy {
            return None;
        }
        Some(pad(
            None,
            PaddingCommand::Continue,
            &mut self.write_once_user_uuid,
            true,
            &self.seed,
        ))
    }

    pub fn frame(&mut self, mb: MultiBuffer) -> MultiBuffer {
        if self.state.direct_copy {
            return mb;
        }

        let tls = {
            let mut tls = self.traffic_state.tls();
            if tls.is_filtering() {
                filter_tls(&mb, &mut tls);
            }
            tls.clone()
        };

        if !self.state.is_padding {
            return mb;
        }

        let is_complete = is_complete_record(&mb);
        let mb = reshape_multi_buffer(mb);
        let last_index = mb.len().saturating_sub(1);
        let final_command = if tls.enable_xtls {
            PaddingCommand::Direct
        } else {
            PaddingCommand::End
        };
        let mut long_padding = tls.is_tls;

        let mut framed = Vec::with_capacity(mb.len());
        let mut chunks = mb.into_iter().enumerate();
        while let Some((i, chunk)) = chunks.next() {
            if tls.is_tls
                && is_complete
                && chunk.len() >= 6
                && chunk[..3] == TLS_APPLICATION_DATA_START
            {
                if tls.enable_xtls {
                    self.pending_direct_copy = true;
                }
                let command = if i == last_index {
                    final_command
                } else {
                    PaddingCommand::Continue
                };
                framed.push(pad(
                    Some(chunk),
                    command,
                    &mut self.write_once_user_uuid,
                    true,
                    &self.seed,
                ));
                self.state.is_padding = false;
                long_padding = false;
                continue;
            } else if !tls.is_tls12_or_above && tls.packets_to_filter <= 1 {
                // finish one packet early for receivers that stop filtering first
                self.state.is_padding = false;
                framed.push(pad(
                    Some(chunk),
                    PaddingCommand::End,
                    &mut self.write_once_user_uuid,
                    long_padding,
                    &self.seed,
                ));
                log::debug!("VISION WRITE: padding ended early, not tls 1.2 or above");
                framed.extend(chunks.map(|(_, rest)| rest));
                break;
            }

            let command = if i == last_index && !self.state.is_padding {
                final_command
            } else {
                PaddingCommand::Continue
            };
            framed.push(pad(
                Some(chunk),
                command,
                &mut self.write_once_user_uuid,
                long_padding,
                &self.seed,
            ));
        }

        framed
    }
}
