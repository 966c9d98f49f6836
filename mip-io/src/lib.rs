//! MIP I/O Components
//!
//! Chain endpoints that touch the outside world: a pacing timer to start
//! chains, UDP transport for RTP and RTCP, and raw PCM files.

pub mod pcm;
pub mod socket;
pub mod timer;
pub mod udp;

pub use pcm::{PcmFileConfig, PcmFileReader, PcmFileWriter};
pub use socket::{RtpSocket, SocketError};
pub use timer::PacingTimer;
pub use udp::{Destination, UdpInputStats, UdpOutputStats, UdpRtpInput, UdpRtpOutput};
