//! MIP RTP Support
//!
//! RTP and RTCP wire formats plus the receive and send paths built on them:
//! timestamp unwrapping, per-source playout timing with an adaptive jitter
//! offset, cross-stream synchronization, fragment reassembly, payload
//! decoder plugins and the decoder and encoder components.

pub mod decoder;
pub mod decoders;
pub mod encoder;
pub mod packet;
pub mod reassembly;
pub mod rtcp;
pub mod sync;
pub mod timestamp;
pub mod timing;

pub use decoder::{DecoderStats, RtpDecoder, RtpDecoderConfig, Ssrc};
pub use decoders::{
    DecodeError, DecodedMessage, DecoderRegistry, H263Decoder, L16Decoder, PassthroughDecoder,
    RtpPacketDecoder,
};
pub use encoder::{EncoderStats, RtpEncoder, RtpEncoderConfig, PT_H263, PT_L16_MONO};
pub use packet::{is_rtcp, RtpError, RtpPacket};
pub use reassembly::{Fragment, ReassembledFrame, Reassembler, ReassemblyError, ReassemblyStats};
pub use rtcp::{NtpTimestamp, RtcpPacket, SdesChunk, SenderReport};
pub use sync::{RtpSynchronizer, SyncRegistration};
pub use timestamp::{SequenceUnwrapper, TimestampUnwrapper, TimestampUpdate};
pub use timing::{JitterController, SourceTiming, TimingConfig};
