use bytes::{BufMut, BytesMut};

use crate::engine::{EngineError, EngineResult};

/// Reserved for framing and handshake traffic.
pub const HANDSHAKE_ID: u16 = 0;
/// Default id carried by packets produced by the line codec.
pub const LINE_ID: u16 = 1;
/// Marks an rpc call that expects no response.
pub const RPC_NOTIFY_ID: u16 = u16::MAX - 2;
/// Marks an rpc call that expects exactly one response.
pub const RPC_REQUEST_ID: u16 = u16::MAX - 1;
/// Marks the response to an rpc call request.
pub const RPC_RESPONSE_ID: u16 = u16::MAX;

/// Ids above application limits that the engine itself owns.
pub fn is_reserved_id(id: u16) -> bool {
    id == RPC_NOTIFY_ID || id == RPC_REQUEST_ID || id == RPC_RESPONSE_ID
}

/// A mutable byte buffer tagged with an id and a read cursor.
///
/// A packet is either being built (`writeable`) or being consumed,
/// never both; `seal` flips one into the other. The rpc role of a
/// packet derives from its reserved id, so at most one of
/// `is_call_request` / `is_call_notify` / `is_call_response` holds.
#[derive(Debug)]
pub struct Packet {
    id: u16,
    data: BytesMut,
    read_pos: usize,
    writeable: bool,
}

impl Packet {
    /// New empty packet in build mode.
    pub fn new(id: u16) -> Packet {
        Packet {
            id,
            data: BytesMut::new(),
            read_pos: 0,
            writeable: true,
        }
    }

    /// Wrap an already-complete payload in consume mode, as the codecs
    /// do after pulling a frame off the wire.
    pub fn from_payload(id: u16, data: BytesMut) -> Packet {
        Packet {
            id,
            data,
            read_pos: 0,
            writeable: false,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn payload_len(&self) -> usize {
        self.data.len()
    }

    pub fn take_payload(self) -> BytesMut {
        self.data
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    /// Finish building; the packet becomes consumable.
    pub fn seal(&mut self) {
        self.writeable = false;
        self.read_pos = 0;
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> EngineResult<()> {
        if !self.writeable {
            return Err(EngineError::IllegalState(
                "write into a sealed packet".into(),
            ));
        }
        self.data.put_slice(bytes);
        Ok(())
    }

    /// Copy out up to `out.len()` bytes from the read cursor.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> usize {
        if self.writeable {
            return 0;
        }
        let n = out.len().min(self.remaining());
        out[..n].copy_from_slice(&self.data[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        n
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn is_call_request(&self) -> bool {
        self.id == RPC_REQUEST_ID
    }

    pub fn is_call_notify(&self) -> bool {
        self.id == RPC_NOTIFY_ID
    }

    pub fn is_call_response(&self) -> bool {
        self.id == RPC_RESPONSE_ID
    }

    pub fn mark_call_request(&mut self) {
        self.id = RPC_REQUEST_ID;
    }

    pub fn mark_call_notify(&mut self) {
        self.id = RPC_NOTIFY_ID;
    }

    pub fn mark_call_response(&mut self) {
        self.id = RPC_RESPONSE_ID;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_then_consume() {
        let mut packet = Packet::new(7);
        packet.write_bytes(b"abc").unwrap();
        packet.write_bytes(b"def").unwrap();
        assert_eq!(packet.payload_len(), 6);

        packet.seal();
        assert!(packet.write_bytes(b"x").is_err());

        let mut out = [0u8; 4];
        assert_eq!(packet.read_bytes(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(packet.remaining(), 2);
    }

    #[test]
    fn test_read_from_writeable_packet_yields_nothing() {
        let mut packet = Packet::new(1);
        packet.write_bytes(b"abc").unwrap();
        let mut out = [0u8; 3];
        assert_eq!(packet.read_bytes(&mut out), 0);
    }

    #[test]
    fn test_rpc_roles_are_exclusive() {
        let mut packet = Packet::new(42);
        assert!(!packet.is_call_request());
        assert!(!packet.is_call_notify());
        assert!(!packet.is_call_response());

        packet.mark_call_request();
        assert!(packet.is_call_request());
        assert!(!packet.is_call_notify());
        assert!(!packet.is_call_response());

        packet.mark_call_response();
        assert!(packet.is_call_response());
        assert!(!packet.is_call_request());
    }
}
