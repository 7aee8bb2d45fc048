// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::engine::{EngineError, EngineResult};
use crate::packet::packet::{is_reserved_id, Packet, LINE_ID};
use crate::stream::ByteStream;

/// `[id: u16][payload_length: u32]`, network byte order.
pub const FRAME_HEADER_LEN: usize = 6;

/// Anti-DoS guard consulted before a frame is accepted off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketLimits {
    pub max_id: u16,
    pub max_length: u32,
}

impl Default for PacketLimits {
    fn default() -> Self {
        Self {
            max_id: 4096,
            max_length: 1024 * 1024,
        }
    }
}

/// Converts between wire bytes and packets.
///
/// `decode` fails with the `NeedRecv` marker when the stream does not
/// yet hold a full frame; that is a wait signal, not an error. Anything
/// else it returns is fatal for the connection. `encode` performs no
/// I/O, it only appends to the supplied outbound stream.
pub trait PacketCodec: Send + Sync {
    fn decode(&self, stream: &mut ByteStream, limits: &PacketLimits) -> EngineResult<Packet>;
    fn encode(&self, packet: &Packet, out: &mut ByteStream) -> EngineResult<()>;
}

/// Default codec: `u16 id | u32 length | payload`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    fn check_header(id: u16, length: u32, limits: &PacketLimits) -> EngineResult<()> {
        if length > limits.max_length {
            return Err(EngineError::PacketTooLarge(format!(
                "frame of length {} is too large, limit {}",
                length, limits.max_length
            )));
        }
        if id > limits.max_id && !is_reserved_id(id) {
            return Err(EngineError::MalformedPacket(format!(
                "packet id {} above limit {}",
                id, limits.max_id
            )));
        }
        Ok(())
    }
}

impl PacketCodec for FrameCodec {
    fn decode(&self, stream: &mut ByteStream, limits: &PacketLimits) -> EngineResult<Packet> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if stream.peek(&mut header) < FRAME_HEADER_LEN {
            return Err(EngineError::NeedRecv);
        }
        let id = u16::from_be_bytes([header[0], header[1]]);
        let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        Self::check_header(id, length, limits)?;

        if stream.read_avail() < FRAME_HEADER_LEN + length as usize {
            return Err(EngineError::NeedRecv);
        }

        stream.remove(FRAME_HEADER_LEN);
        let mut payload = vec![0u8; length as usize];
        let read = stream.read(&mut payload);
        debug_assert_eq!(read, length as usize);
        Ok(Packet::from_payload(id, BytesMut::from(&payload[..])))
    }

    fn encode(&self, packet: &Packet, out: &mut ByteStream) -> EngineResult<()> {
        let payload = packet.payload();
        if payload.len() > u32::MAX as usize {
            return Err(EngineError::PacketTooLarge(format!(
                "payload of {} bytes does not fit a u32 length",
                payload.len()
            )));
        }
        // assemble the whole frame first, a half-written header would
        // corrupt the outbound stream
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&packet.id().to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        if out.write(&frame) == 0 {
            return Err(EngineError::SendBufferFull(format!(
                "outbound stream rejected {} bytes",
                frame.len()
            )));
        }
        Ok(())
    }
}

/// Line-oriented codec: a packet per `\n`-terminated line, trailing
/// `\r` stripped. Useful for handshakes and text protocols; shares the
/// `(stream, limits)` shape with `FrameCodec` so the two are
/// interchangeable per manager or per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineCodec;

impl PacketCodec for LineCodec {
    fn decode(&self, stream: &mut ByteStream, limits: &PacketLimits) -> EngineResult<Packet> {
        let scan_limit = (limits.max_length as usize).saturating_add(1);
        let avail = stream.read_avail().min(scan_limit);
        let mut head = vec![0u8; avail];
        stream.peek(&mut head);

        match head.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                stream.remove(pos + 1);
                let mut line = &head[..pos];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                Ok(Packet::from_payload(LINE_ID, BytesMut::from(line)))
            }
            None if stream.read_avail() > limits.max_length as usize => {
                Err(EngineError::PacketTooLarge(format!(
                    "line exceeds {} bytes without a terminator",
                    limits.max_length
                )))
            }
            None => Err(EngineError::NeedRecv),
        }
    }

    fn encode(&self, packet: &Packet, out: &mut ByteStream) -> EngineResult<()> {
        let payload = packet.payload();
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        if out.write(&line) == 0 {
            return Err(EngineError::SendBufferFull(format!(
                "outbound stream rejected {} bytes",
                line.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::packet::RPC_RESPONSE_ID;

    fn limits() -> PacketLimits {
        PacketLimits {
            max_id: 100,
            max_length: 1024,
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let codec = FrameCodec;
        let mut packet = Packet::new(42);
        packet.write_bytes(b"the payload").unwrap();
        packet.seal();

        let mut stream = ByteStream::new();
        codec.encode(&packet, &mut stream).unwrap();
        assert_eq!(stream.read_avail(), FRAME_HEADER_LEN + 11);

        let decoded = codec.decode(&mut stream, &limits()).unwrap();
        assert_eq!(decoded.id(), 42);
        assert_eq!(decoded.payload(), b"the payload");
        assert!(stream.is_empty());
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let codec = FrameCodec;
        let mut heartbeat = Packet::new(9);
        heartbeat.seal();
        let mut stream = ByteStream::new();
        codec.encode(&heartbeat, &mut stream).unwrap();

        let decoded = codec.decode(&mut stream, &limits()).unwrap();
        assert_eq!(decoded.id(), 9);
        assert_eq!(decoded.payload_len(), 0);
    }

    #[test]
    fn test_partial_header_is_need_recv_never_invalid() {
        let codec = FrameCodec;
        for k in 0..FRAME_HEADER_LEN {
            let mut stream = ByteStream::new();
            stream.write(&vec![0u8; k]);
            let err = codec.decode(&mut stream, &limits()).unwrap_err();
            assert!(err.is_need_recv(), "k={} gave {:?}", k, err);
            // nothing consumed while waiting
            assert_eq!(stream.read_avail(), k);
        }
    }

    #[test]
    fn test_partial_payload_is_need_recv() {
        let codec = FrameCodec;
        let mut stream = ByteStream::new();
        stream.write(&5u16.to_be_bytes());
        stream.write(&100u32.to_be_bytes());
        stream.write(&[0u8; 10]); // 90 bytes short
        let err = codec.decode(&mut stream, &limits()).unwrap_err();
        assert!(err.is_need_recv());
    }

    #[test]
    fn test_oversized_length_is_fatal_even_when_short() {
        let codec = FrameCodec;
        let mut stream = ByteStream::new();
        stream.write(&5u16.to_be_bytes());
        stream.write(&(limits().max_length + 1).to_be_bytes());
        // no payload bytes at all: the declared length alone is hostile
        let err = codec.decode(&mut stream, &limits()).unwrap_err();
        assert!(matches!(err, EngineError::PacketTooLarge(_)));
    }

    #[test]
    fn test_oversized_id_is_fatal() {
        let codec = FrameCodec;
        let mut stream = ByteStream::new();
        stream.write(&1000u16.to_be_bytes());
        stream.write(&0u32.to_be_bytes());
        let err = codec.decode(&mut stream, &limits()).unwrap_err();
        assert!(matches!(err, EngineError::MalformedPacket(_)));
    }

    #[test]
    fn test_reserved_rpc_ids_pass_the_id_limit() {
        let codec = FrameCodec;
        let mut packet = Packet::new(RPC_RESPONSE_ID);
        packet.write_bytes(b"x").unwrap();
        packet.seal();
        let mut stream = ByteStream::new();
        codec.encode(&packet, &mut stream).unwrap();
        let decoded = codec.decode(&mut stream, &limits()).unwrap();
        assert!(decoded.is_call_response());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let codec = FrameCodec;
        let mut stream = ByteStream::new();
        for (id, body) in [(1u16, &b"one"[..]), (2u16, &b"two"[..])] {
            let mut p = Packet::new(id);
            p.write_bytes(body).unwrap();
            p.seal();
            codec.encode(&p, &mut stream).unwrap();
        }
        assert_eq!(codec.decode(&mut stream, &limits()).unwrap().payload(), b"one");
        assert_eq!(codec.decode(&mut stream, &limits()).unwrap().payload(), b"two");
        assert!(codec.decode(&mut stream, &limits()).unwrap_err().is_need_recv());
    }

    #[test]
    fn test_line_codec_strips_crlf() {
        let codec = LineCodec;
        let mut stream = ByteStream::new();
        stream.write(b"hello\r\nworld\n");

        let first = codec.decode(&mut stream, &limits()).unwrap();
        assert_eq!(first.payload(), b"hello");
        let second = codec.decode(&mut stream, &limits()).unwrap();
        assert_eq!(second.payload(), b"world");
        assert!(codec.decode(&mut stream, &limits()).unwrap_err().is_need_recv());
    }

    #[test]
    fn test_line_codec_without_newline_waits() {
        let codec = LineCodec;
        let mut stream = ByteStream::new();
        stream.write(b"no newline yet");
        assert!(codec.decode(&mut stream, &limits()).unwrap_err().is_need_recv());
        assert_eq!(stream.read_avail(), 14);
    }

    #[test]
    fn test_line_codec_unterminated_flood_is_fatal() {
        let codec = LineCodec;
        let tight = PacketLimits {
            max_id: 100,
            max_length: 8,
        };
        let mut stream = ByteStream::new();
        stream.write(b"way too long without a break");
        let err = codec.decode(&mut stream, &tight).unwrap_err();
        assert!(matches!(err, EngineError::PacketTooLarge(_)));
    }

    #[test]
    fn test_line_codec_encode_appends_newline() {
        let codec = LineCodec;
        let mut packet = Packet::new(LINE_ID);
        packet.write_bytes(b"hello").unwrap();
        packet.seal();
        let mut stream = ByteStream::new();
        codec.encode(&packet, &mut stream).unwrap();

        let mut out = vec![0u8; stream.read_avail()];
        stream.read(&mut out);
        assert_eq!(out, b"hello\n");
    }
}
