//! MIP Mixers
//!
//! Terminal components of a receive chain. Each mixer runs its own playback
//! timeline that advances one step per chain iteration, combines whatever
//! the decoders delivered for the current step and reports the timeline
//! position upstream through feedback.

pub mod audio;
pub mod video;

pub use audio::{AudioMixer, AudioMixerConfig, AudioMixerStats};
pub use video::{VideoMixer, VideoMixerConfig, VideoMixerStats};
