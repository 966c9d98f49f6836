//! MIP Dataflow Kernel
//!
//! This crate implements the component chain at the heart of the library:
//! typed messages, the component contract, per-iteration output queues,
//! feedback messages, media time and the chain scheduler that drives a graph
//! of components from a background thread.

pub mod chain;
pub mod component;
pub mod feedback;
pub mod message;
pub mod queue;
pub mod time;

pub use chain::{
    Chain, ChainError, ChainExit, ChainFailure, ChainObserver, ChannelObserver, FeedbackChain,
    LogObserver, Schedule, ScheduledConnection,
};
pub use component::{
    shared, ChainContext, ChainId, Component, ComponentError, ComponentId, SharedComponent,
};
pub use feedback::Feedback;
pub use message::{
    message_type, subtype, AudioEncoding, AudioFrame, EncodedAudio, EncodedVideo, Message,
    MessageFilter, MessageRef, RtpDatagram, RtpKind, SystemMessage, VideoEncoding, VideoFrame,
};
pub use queue::IterationQueue;
pub use time::{Clock, ManualClock, MediaTime, SystemClock, Timer};
