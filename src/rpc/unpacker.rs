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

use bytes::{Buf, BytesMut};

use super::packer::{tag, Packable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RpcUnpackError {
    /// short input, or a value that does not fit the requested type
    #[error("value out of range")]
    OutOfRange,
    /// tag byte does not announce the requested type
    #[error("type mismatch")]
    TypeMismatch,
}

/// Type-tagged binary deserializer.
///
/// Never fails per call: on short or invalid input it latches the first
/// error and every subsequent `unpack_*` yields a default value. Check
/// `error()` once after a batch of unpacks instead of after each field.
#[derive(Debug)]
pub struct RpcUnpacker {
    buf: BytesMut,
    error: Option<RpcUnpackError>,
}

impl RpcUnpacker {
    pub fn new(buf: BytesMut) -> Self {
        RpcUnpacker { buf, error: None }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(BytesMut::from(bytes))
    }

    pub fn error(&self) -> Option<RpcUnpackError> {
        self.error
    }

    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn fail(&mut self, error: RpcUnpackError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn need(&mut self, n: usize) -> bool {
        if self.error.is_some() {
            return false;
        }
        if self.buf.remaining() < n {
            self.fail(RpcUnpackError::OutOfRange);
            return false;
        }
        true
    }

    /// Integer decode shared by all the integer unpacks; i128 holds the
    /// full i64 and u64 ranges.
    fn read_integer(&mut self) -> i128 {
        if !self.need(1) {
            return 0;
        }
        let t = self.buf.get_u8();
        match t {
            // raw byte is the fixint value
            0x00..=tag::POS_FIXINT_MAX => t as i128,
            tag::NEG_FIXINT_MIN..=0xff => (t as i8) as i128,
            tag::UINT8 => {
                if self.need(1) {
                    self.buf.get_u8() as i128
                } else {
                    0
                }
            }
            tag::UINT16 => {
                if self.need(2) {
                    self.buf.get_u16() as i128
                } else {
                    0
                }
            }
            tag::UINT32 => {
                if self.need(4) {
                    self.buf.get_u32() as i128
                } else {
                    0
                }
            }
            tag::UINT64 => {
                if self.need(8) {
                    self.buf.get_u64() as i128
                } else {
                    0
                }
            }
            tag::INT8 => {
                if self.need(1) {
                    self.buf.get_i8() as i128
                } else {
                    0
                }
            }
            tag::INT16 => {
                if self.need(2) {
                    self.buf.get_i16() as i128
                } else {
                    0
                }
            }
            tag::INT32 => {
                if self.need(4) {
                    self.buf.get_i32() as i128
                } else {
                    0
                }
            }
            tag::INT64 => {
                if self.need(8) {
                    self.buf.get_i64() as i128
                } else {
                    0
                }
            }
            _ => {
                self.fail(RpcUnpackError::TypeMismatch);
                0
            }
        }
    }

    pub fn unpack_i64(&mut self) -> i64 {
        let v = self.read_integer();
        if v < i64::MIN as i128 || v > i64::MAX as i128 {
            self.fail(RpcUnpackError::OutOfRange);
            return 0;
        }
        v as i64
    }

    pub fn unpack_u64(&mut self) -> u64 {
        let v = self.read_integer();
        if !(0..=u64::MAX as i128).contains(&v) {
            self.fail(RpcUnpackError::OutOfRange);
            return 0;
        }
        v as u64
    }

    pub fn unpack_i32(&mut self) -> i32 {
        let v = self.read_integer();
        if v < i32::MIN as i128 || v > i32::MAX as i128 {
            self.fail(RpcUnpackError::OutOfRange);
            return 0;
        }
        v as i32
    }

    pub fn unpack_u32(&mut self) -> u32 {
        let v = self.read_integer();
        if !(0..=u32::MAX as i128).contains(&v) {
            self.fail(RpcUnpackError::OutOfRange);
            return 0;
        }
        v as u32
    }

    pub fn unpack_bool(&mut self) -> bool {
        if !self.need(1) {
            return false;
        }
        match self.buf.get_u8() {
            tag::TRUE => true,
            tag::FALSE => false,
            _ => {
                self.fail(RpcUnpackError::TypeMismatch);
                false
            }
        }
    }

    /// Consume a nil if one is next. Never sets an error.
    pub fn unpack_nil(&mut self) -> bool {
        if self.error.is_some() || self.buf.remaining() < 1 {
            return false;
        }
        if self.buf[0] == tag::NIL {
            self.buf.advance(1);
            true
        } else {
            false
        }
    }

    pub fn unpack_f64(&mut self) -> f64 {
        if !self.need(1) {
            return 0.0;
        }
        match self.buf.get_u8() {
            tag::FLOAT32 => {
                if self.need(4) {
                    f32::from_bits(self.buf.get_u32()) as f64
                } else {
                    0.0
                }
            }
            tag::FLOAT64 => {
                if self.need(8) {
                    f64::from_bits(self.buf.get_u64())
                } else {
                    0.0
                }
            }
            _ => {
                self.fail(RpcUnpackError::TypeMismatch);
                0.0
            }
        }
    }

    pub fn unpack_f32(&mut self) -> f32 {
        if !self.need(1) {
            return 0.0;
        }
        match self.buf.get_u8() {
            tag::FLOAT32 => {
                if self.need(4) {
                    f32::from_bits(self.buf.get_u32())
                } else {
                    0.0
                }
            }
            _ => {
                self.fail(RpcUnpackError::TypeMismatch);
                0.0
            }
        }
    }

    pub fn unpack_str(&mut self) -> String {
        if !self.need(1) {
            return String::new();
        }
        let t = self.buf.get_u8();
        let len = match t {
            t if (tag::FIXSTR_BASE..=0xbf).contains(&t) => (t & 0x1f) as usize,
            tag::STR8 => {
                if !self.need(1) {
                    return String::new();
                }
                self.buf.get_u8() as usize
            }
            tag::STR16 => {
                if !self.need(2) {
                    return String::new();
                }
                self.buf.get_u16() as usize
            }
            tag::STR32 => {
                if !self.need(4) {
                    return String::new();
                }
                self.buf.get_u32() as usize
            }
            _ => {
                self.fail(RpcUnpackError::TypeMismatch);
                return String::new();
            }
        };
        if !self.need(len) {
            return String::new();
        }
        let bytes = self.buf.split_to(len);
        match String::from_utf8(bytes.to_vec()) {
            Ok(s) => s,
            Err(_) => {
                self.fail(RpcUnpackError::TypeMismatch);
                String::new()
            }
        }
    }

    pub fn unpack_bin(&mut self) -> Vec<u8> {
        if !self.need(1) {
            return Vec::new();
        }
        let t = self.buf.get_u8();
        let len = match t {
            tag::BIN8 => {
                if !self.need(1) {
                    return Vec::new();
                }
                self.buf.get_u8() as usize
            }
            tag::BIN16 => {
                if !self.need(2) {
                    return Vec::new();
                }
                self.buf.get_u16() as usize
            }
            tag::BIN32 => {
                if !self.need(4) {
                    return Vec::new();
                }
                self.buf.get_u32() as usize
            }
            _ => {
                self.fail(RpcUnpackError::TypeMismatch);
                return Vec::new();
            }
        };
        if !self.need(len) {
            return Vec::new();
        }
        self.buf.split_to(len).to_vec()
    }

    pub fn unpack_array_len(&mut self) -> usize {
        if !self.need(1) {
            return 0;
        }
        let t = self.buf.get_u8();
        match t {
            t if (tag::FIXARRAY_BASE..=0x9f).contains(&t) => (t & 0x0f) as usize,
            tag::ARRAY16 => {
                if self.need(2) {
                    self.buf.get_u16() as usize
                } else {
                    0
                }
            }
            tag::ARRAY32 => {
                if self.need(4) {
                    self.buf.get_u32() as usize
                } else {
                    0
                }
            }
            _ => {
                self.fail(RpcUnpackError::TypeMismatch);
                0
            }
        }
    }

    pub fn unpack_map_len(&mut self) -> usize {
        if !self.need(1) {
            return 0;
        }
        let t = self.buf.get_u8();
        match t {
            t if (tag::FIXMAP_BASE..=0x8f).contains(&t) => (t & 0x0f) as usize,
            tag::MAP16 => {
                if self.need(2) {
                    self.buf.get_u16() as usize
                } else {
                    0
                }
            }
            tag::MAP32 => {
                if self.need(4) {
                    self.buf.get_u32() as usize
                } else {
                    0
                }
            }
            _ => {
                self.fail(RpcUnpackError::TypeMismatch);
                0
            }
        }
    }

    /// Decode a nested struct from its embedded binary blob. An error
    /// inside the nested decode latches on this unpacker.
    pub fn unpack_packable<T: Packable>(&mut self) -> T {
        let bytes = self.unpack_bin();
        let mut nested = RpcUnpacker::from_slice(&bytes);
        let value = T::unpack_fields(&mut nested);
        if let Some(e) = nested.error() {
            self.fail(e);
        }
        value
    }
}
