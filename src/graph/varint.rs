// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! LEB128 integers used by the model file tables.
//!
//! Unsigned values use 7 bits per byte with the high bit as continuation.
//! Signed values (tensor dims, where `-1` marks a dynamic extent) are
//! zigzag-mapped first so small negatives stay one byte.

use std::io::{self, Read, Write};

/// ceil(64 / 7)
const MAX_BYTES: usize = 10;

pub fn write_uleb<W: Write>(w: &mut W, mut value: u64) -> io::Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return w.write_all(&[byte]);
        }
        w.write_all(&[byte | 0x80])?;
    }
}

pub fn read_uleb<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut result = 0u64;
    let mut byte = [0u8; 1];
    for i in 0..MAX_BYTES {
        r.read_exact(&mut byte)?;
        let low = u64::from(byte[0] & 0x7f);
        let shift = 7 * i as u32;
        if shift == 63 && low > 1 {
            return Err(invalid("uleb128 value overflows u64"));
        }
        result |= low << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(invalid("uleb128 value longer than 10 bytes"))
}

#[inline]
pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn write_sleb<W: Write>(w: &mut W, value: i64) -> io::Result<()> {
    write_uleb(w, zigzag(value))
}

pub fn read_sleb<R: Read>(r: &mut R) -> io::Result<i64> {
    read_uleb(r).map(unzigzag)
}

/// Read a `usize`, rejecting values that do not fit the platform.
pub fn read_len<R: Read>(r: &mut R) -> io::Result<usize> {
    usize::try_from(read_uleb(r)?).map_err(|_| invalid("length does not fit in usize"))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn small_values_take_one_byte() {
        let mut buf = Vec::new();
        write_uleb(&mut buf, 127).unwrap();
        assert_eq!(buf, vec![0x7f]);
        buf.clear();
        write_uleb(&mut buf, 128).unwrap();
        assert_eq!(buf, vec![0x80, 0x01]);
    }

    #[test]
    fn extremes_decode() {
        for v in [0u64, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_uleb(&mut buf, v).unwrap();
            assert_eq!(read_uleb(&mut Cursor::new(&buf)).unwrap(), v);
        }
        for v in [-1i64, 0, 1, i64::MIN, i64::MAX] {
            let mut buf = Vec::new();
            write_sleb(&mut buf, v).unwrap();
            assert_eq!(read_sleb(&mut Cursor::new(&buf)).unwrap(), v);
        }
    }

    #[test]
    fn dynamic_marker_is_one_byte() {
        let mut buf = Vec::new();
        write_sleb(&mut buf, -1).unwrap();
        assert_eq!(buf, vec![1]);
    }

    #[test]
    fn truncated_and_overlong_inputs_fail() {
        assert!(read_uleb(&mut Cursor::new(&[0x80u8][..])).is_err());
        assert!(read_uleb(&mut Cursor::new(&[0xffu8; 11][..])).is_err());
        assert!(read_uleb(&mut Cursor::new(&[][..])).is_err());
    }
}
