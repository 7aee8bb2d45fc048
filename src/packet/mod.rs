//! Packet framing.
//!
//! A `Packet` is a byte buffer tagged with a u16 id; a `PacketCodec`
//! turns stream bytes into packets and back. Two codecs ship with the
//! engine: the length-prefixed `FrameCodec` (default) and the
//! line-oriented `LineCodec`. Both are pure with respect to sockets,
//! they only ever touch `ByteStream`s.

pub use codec::{FrameCodec, LineCodec, PacketCodec, PacketLimits, FRAME_HEADER_LEN};
pub use packet::{
    is_reserved_id, Packet, HANDSHAKE_ID, LINE_ID, RPC_NOTIFY_ID, RPC_REQUEST_ID, RPC_RESPONSE_ID,
};

mod codec;
mod packet;
