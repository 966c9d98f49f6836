//! MIP - Media Processing Chains
//!
//! Components connected into chains that a background thread drives once
//! per timer tick, with RTP receive and send paths, mixers and UDP and file
//! endpoints built on top.

pub use mip_core as core;
pub use mip_io as io;
pub use mip_mixer as mixer;
pub use mip_rtp as rtp;

// Re-export commonly used types
pub use mip_core::{
    shared, Chain, ChainError, ChainExit, Component, ComponentError, Feedback, FeedbackChain,
    MediaTime, Message, MessageFilter, MessageRef, SharedComponent,
};
