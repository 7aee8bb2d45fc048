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

pub const DEFAULT_MIN_CAPACITY: usize = 4 * 1024;
pub const DEFAULT_MAX_CAPACITY: usize = 64 * 1024 * 1024;

/// Growable ring buffer of bytes backing a connection's receive and
/// send sides.
///
/// Capacity is always a power of two so index wrap is a mask. The
/// buffer grows by doubling up to `max_capacity` and never shrinks
/// below the configured minimum. No operation signals failure with an
/// error: every call returns a byte count, and 0 means "nothing
/// available" or "did not fit", never a broken stream.
#[derive(Debug)]
pub struct ByteStream {
    buf: Vec<u8>,
    read_pos: usize,
    len: usize,
    max_capacity: usize,
}

impl Default for ByteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MIN_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    pub fn with_capacity(min_capacity: usize, max_capacity: usize) -> Self {
        let min = min_capacity.max(16).next_power_of_two();
        let max = max_capacity.max(min).next_power_of_two();
        ByteStream {
            buf: vec![0; min],
            read_pos: 0,
            len: 0,
            max_capacity: max,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn read_avail(&self) -> usize {
        self.len
    }

    pub fn write_avail(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.len = 0;
    }

    /// Append `data`, growing if necessary. All or nothing: returns
    /// `data.len()` on success and 0 when the bytes would not fit even
    /// at `max_capacity`.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        if data.len() > self.write_avail() && !self.grow(self.len + data.len()) {
            return 0;
        }

        let cap = self.capacity();
        let mask = cap - 1;
        let write_pos = (self.read_pos + self.len) & mask;
        let first = data.len().min(cap - write_pos);
        self.buf[write_pos..write_pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
        self.len += data.len();
        data.len()
    }

    /// Copy out and consume up to `out.len()` bytes.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.advance(n);
        n
    }

    /// Copy out up to `out.len()` bytes without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        self.peek_at(0, out)
    }

    /// Peek starting `offset` bytes past the read position.
    pub fn peek_at(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = out.len().min(self.len - offset);
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let mask = cap - 1;
        let start = (self.read_pos + offset) & mask;
        let first = n.min(cap - start);
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        if first < n {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        n
    }

    /// Consume up to `n` bytes without copying. Used after a decoder
    /// has already inspected the head via `peek`.
    pub fn remove(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.advance(n);
        n
    }

    fn advance(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n) & (self.capacity() - 1);
        self.len -= n;
        if self.len == 0 {
            self.read_pos = 0;
        }
    }

    fn grow(&mut self, required: usize) -> bool {
        if required > self.max_capacity {
            return false;
        }
        let new_cap = required.next_power_of_two().min(self.max_capacity);
        if new_cap <= self.capacity() {
            return false;
        }
        let mut new_buf = vec![0; new_cap];
        let copied = self.peek_at(0, &mut new_buf[..self.len]);
        debug_assert_eq!(copied, self.len);
        self.buf = new_buf;
        self.read_pos = 0;
        true
    }
}
