//! Variable-length unsigned integers, used for every length field in cell
//! and record encodings.
//!
//! The first byte selects the width:
//!
//! | Marker  | Bytes | Value                                   |
//! |---------|-------|-----------------------------------------|
//! | 0-240   | 1     | the marker itself                       |
//! | 241-248 | 2     | `240 + (marker-241)*256 + b1`           |
//! | 249     | 3     | `2288 + b1*256 + b2`                    |
//! | 250     | 4     | 3-byte big-endian                       |
//! | 251     | 5     | 4-byte big-endian                       |
//! | 255     | 9     | 8-byte big-endian                       |
//!
//! Markers 252-254 are unused; hitting one while decoding means the input
//! is corrupt. Small lengths, by far the common case, cost one byte.

use eyre::{bail, ensure, Result};

pub fn varint_len(value: u64) -> usize {
    match value {
        0..=240 => 1,
        241..=2287 => 2,
        2288..=67823 => 3,
        67824..=0xFF_FFFF => 4,
        0x100_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Appends the encoding of `value` to `out`.
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=240 => out.push(value as u8),
        241..=2287 => {
            let v = value - 240;
            out.push(241 + (v >> 8) as u8);
            out.push(v as u8);
        }
        2288..=67823 => {
            let v = value - 2288;
            out.push(249);
            out.push((v >> 8) as u8);
            out.push(v as u8);
        }
        67824..=0xFF_FFFF => {
            out.push(250);
            out.extend_from_slice(&value.to_be_bytes()[5..]);
        }
        0x100_0000..=0xFFFF_FFFF => {
            out.push(251);
            out.extend_from_slice(&value.to_be_bytes()[4..]);
        }
        _ => {
            out.push(255);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

/// Decodes a varint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
    ensure!(!buf.is_empty(), "empty buffer for varint");
    let marker = buf[0];

    let tail = |n: usize| -> Result<u64> {
        ensure!(buf.len() > n, "truncated {}-byte varint", n + 1);
        Ok(buf[1..=n].iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
    };

    match marker {
        0..=240 => Ok((marker as u64, 1)),
        241..=248 => {
            ensure!(buf.len() >= 2, "truncated 2-byte varint");
            Ok((240 + ((marker as u64 - 241) << 8) + buf[1] as u64, 2))
        }
        249 => {
            ensure!(buf.len() >= 3, "truncated 3-byte varint");
            Ok((2288 + ((buf[1] as u64) << 8) + buf[2] as u64, 3))
        }
        250 => Ok((tail(3)?, 4)),
        251 => Ok((tail(4)?, 5)),
        255 => Ok((tail(8)?, 9)),
        _ => bail!("invalid varint marker: {}", marker),
    }
}
