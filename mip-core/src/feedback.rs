//! Feedback travelling upstream after each forward pass

use crate::time::MediaTime;

/// Information passed along a feedback chain
///
/// The terminal component sees the message first; each upstream component
/// may read what downstream components filled in and add its own part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feedback {
    chain_id: u64,
    /// Delay added downstream between the mixer and the listener
    pub playback_delay: Option<MediaTime>,
    /// Playout time the terminal consumer has reached
    pub playback_stream_time: Option<MediaTime>,
}

impl Feedback {
    pub fn new(chain_id: u64) -> Self {
        Feedback {
            chain_id,
            ..Default::default()
        }
    }

    /// Index of the feedback chain this message belongs to
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Accumulate a downstream delay
    pub fn add_playback_delay(&mut self, delay: MediaTime) {
        self.playback_delay = Some(self.playback_delay.unwrap_or_default() + delay);
    }
}
