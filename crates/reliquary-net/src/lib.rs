//! Reliquary Network Library
//!
//! Transport plumbing for the sync protocol: content-type negotiation and
//! zlib body encoding, length-prefixed framing, a line-at-a-time reader
//! over received bodies, and the peer connection abstraction. No protocol
//! logic lives here; the contract is duplex delivery of whole message
//! bodies.

pub mod body;
pub mod framing;
pub mod reader;
pub mod transport;

pub use body::ContentType;
pub use framing::{Frame, FrameCodec, FrameKind};
pub use reader::LineReader;
pub use transport::{FramedPeer, Peer, TcpPeer, TransportError};
