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

use bytes::{BufMut, BytesMut};

/// Wire tags of the rpc value format. One byte precedes every value
/// except small non-negative integers and short strings / arrays /
/// maps, which pack length or value into the tag byte itself.
pub(crate) mod tag {
    pub const POS_FIXINT_MAX: u8 = 0x7f;
    pub const FIXMAP_BASE: u8 = 0x80; // 0x80..=0x8f
    pub const FIXARRAY_BASE: u8 = 0x90; // 0x90..=0x9f
    pub const FIXSTR_BASE: u8 = 0xa0; // 0xa0..=0xbf
    pub const NIL: u8 = 0xc0;
    pub const FALSE: u8 = 0xc2;
    pub const TRUE: u8 = 0xc3;
    pub const BIN8: u8 = 0xc4;
    pub const BIN16: u8 = 0xc5;
    pub const BIN32: u8 = 0xc6;
    pub const FLOAT32: u8 = 0xca;
    pub const FLOAT64: u8 = 0xcb;
    pub const UINT8: u8 = 0xcc;
    pub const UINT16: u8 = 0xcd;
    pub const UINT32: u8 = 0xce;
    pub const UINT64: u8 = 0xcf;
    pub const INT8: u8 = 0xd0;
    pub const INT16: u8 = 0xd1;
    pub const INT32: u8 = 0xd2;
    pub const INT64: u8 = 0xd3;
    pub const STR8: u8 = 0xd9;
    pub const STR16: u8 = 0xda;
    pub const STR32: u8 = 0xdb;
    pub const ARRAY16: u8 = 0xdc;
    pub const ARRAY32: u8 = 0xdd;
    pub const MAP16: u8 = 0xde;
    pub const MAP32: u8 = 0xdf;
    pub const NEG_FIXINT_MIN: u8 = 0xe0; // 0xe0..=0xff
}

/// A value that can serialize itself into the rpc wire format.
///
/// Nested values are embedded as a length-prefixed binary blob, so a
/// struct's fields never bleed into the enclosing value stream.
pub trait Packable: Sized {
    fn pack_fields(&self, packer: &mut RpcPacker);
    fn unpack_fields(unpacker: &mut super::RpcUnpacker) -> Self;
}

/// Type-tagged binary serializer for rpc arguments and results.
///
/// Integers always take the smallest representation that round-trips
/// the value; the unpacker switches on the tag byte, so a caller may
/// pack an `i64` and unpack a `u32` as long as the value fits.
#[derive(Debug, Default)]
pub struct RpcPacker {
    buf: BytesMut,
}

impl RpcPacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Splice already-packed bytes in as-is. Used to append packed
    /// arguments behind a call header without re-encoding them.
    pub fn append_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    pub fn pack_nil(&mut self) -> &mut Self {
        self.buf.put_u8(tag::NIL);
        self
    }

    pub fn pack_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(if value { tag::TRUE } else { tag::FALSE });
        self
    }

    pub fn pack_uint(&mut self, value: u64) -> &mut Self {
        if value <= tag::POS_FIXINT_MAX as u64 {
            self.buf.put_u8(value as u8);
        } else if value <= u8::MAX as u64 {
            self.buf.put_u8(tag::UINT8);
            self.buf.put_u8(value as u8);
        } else if value <= u16::MAX as u64 {
            self.buf.put_u8(tag::UINT16);
            self.buf.put_u16(value as u16);
        } else if value <= u32::MAX as u64 {
            self.buf.put_u8(tag::UINT32);
            self.buf.put_u32(value as u32);
        } else {
            self.buf.put_u8(tag::UINT64);
            self.buf.put_u64(value);
        }
        self
    }

    pub fn pack_int(&mut self, value: i64) -> &mut Self {
        if value >= 0 {
            return self.pack_uint(value as u64);
        }
        if value >= -32 {
            self.buf.put_u8(value as i8 as u8);
        } else if value >= i8::MIN as i64 {
            self.buf.put_u8(tag::INT8);
            self.buf.put_i8(value as i8);
        } else if value >= i16::MIN as i64 {
            self.buf.put_u8(tag::INT16);
            self.buf.put_i16(value as i16);
        } else if value >= i32::MIN as i64 {
            self.buf.put_u8(tag::INT32);
            self.buf.put_i32(value as i32);
        } else {
            self.buf.put_u8(tag::INT64);
            self.buf.put_i64(value);
        }
        self
    }

    pub fn pack_u32(&mut self, value: u32) -> &mut Self {
        self.pack_uint(value as u64)
    }

    pub fn pack_i32(&mut self, value: i32) -> &mut Self {
        self.pack_int(value as i64)
    }

    /// IEEE-754 bit pattern written big-endian; no in-memory layout
    /// assumptions reach the wire.
    pub fn pack_f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_u8(tag::FLOAT32);
        self.buf.put_u32(value.to_bits());
        self
    }

    pub fn pack_f64(&mut self, value: f64) -> &mut Self {
        self.buf.put_u8(tag::FLOAT64);
        self.buf.put_u64(value.to_bits());
        self
    }

    pub fn pack_str(&mut self, value: &str) -> &mut Self {
        let len = value.len();
        if len < 32 {
            self.buf.put_u8(tag::FIXSTR_BASE | len as u8);
        } else if len <= u8::MAX as usize {
            self.buf.put_u8(tag::STR8);
            self.buf.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.put_u8(tag::STR16);
            self.buf.put_u16(len as u16);
        } else {
            self.buf.put_u8(tag::STR32);
            self.buf.put_u32(len as u32);
        }
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn pack_bin(&mut self, value: &[u8]) -> &mut Self {
        let len = value.len();
        if len <= u8::MAX as usize {
            self.buf.put_u8(tag::BIN8);
            self.buf.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.put_u8(tag::BIN16);
            self.buf.put_u16(len as u16);
        } else {
            self.buf.put_u8(tag::BIN32);
            self.buf.put_u32(len as u32);
        }
        self.buf.put_slice(value);
        self
    }

    /// Announce an array of `len` values; the caller packs each element
    /// afterwards.
    pub fn pack_array_len(&mut self, len: usize) -> &mut Self {
        if len < 16 {
            self.buf.put_u8(tag::FIXARRAY_BASE | len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.put_u8(tag::ARRAY16);
            self.buf.put_u16(len as u16);
        } else {
            self.buf.put_u8(tag::ARRAY32);
            self.buf.put_u32(len as u32);
        }
        self
    }

    pub fn pack_map_len(&mut self, len: usize) -> &mut Self {
        if len < 16 {
            self.buf.put_u8(tag::FIXMAP_BASE | len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.put_u8(tag::MAP16);
            self.buf.put_u16(len as u16);
        } else {
            self.buf.put_u8(tag::MAP32);
            self.buf.put_u32(len as u32);
        }
        self
    }

    /// Serialize a nested struct into its own byte vector and embed it
    /// as a binary blob.
    pub fn pack_packable<T: Packable>(&mut self, value: &T) -> &mut Self {
        let mut nested = RpcPacker::new();
        value.pack_fields(&mut nested);
        self.pack_bin(nested.as_bytes())
    }
}
