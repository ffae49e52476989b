/*
 * Copyright (c) 2024-2025 Elide Technologies, Inc.
 *
 * Licensed under the MIT license (the "License"); you may not use this file except in compliance
 * with the License. You may obtain a copy of the License at
 *
 *   https://opensource.org/license/mit/
 *
 * Unless required by applicable law or agreed to in writing, software distributed under the License is distributed on
 * an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. See the
 * License for the specific language governing permissions and limitations under the License.
 */

//! btsnoop v1 stream format.
//!
//! The snoop stream opens with a 16-byte file header and then carries back-to-back records, each
//! a 24-byte big-endian header followed by `included_len` bytes of raw H4 frame.

use core::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::codec::{unpack_i64_be, unpack_u32_be};

/// Size of the snoop file header.
pub const FILE_HEADER_LEN: usize = 16;

/// Size of each per-record header.
pub const RECORD_HEADER_LEN: usize = 24;

/// Record timestamps count microseconds since midnight 0001-01-01 (nominal Gregorian); this is
/// the value of that scale at midnight 2000-01-01.
const EPOCH_2000_OFFSET_MICROS: i64 = 0x00E0_3AB4_4A67_6000;

/// Seconds between the Unix epoch and 2000-01-01.
const EPOCH_2000_UNIX_SECS: i64 = 946_684_800;

/// Parsed btsnoop file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnoopHeader {
  pub magic: [u8; 8],
  pub version: u32,
  pub datalink: u32,
}

/// Snoop header decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoopError {
  ShortHeader,
  ShortRecordHeader,
}

impl fmt::Display for SnoopError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SnoopError::ShortHeader => write!(f, "btsnoop file header shorter than {FILE_HEADER_LEN} bytes"),
      SnoopError::ShortRecordHeader => {
        write!(f, "btsnoop record header shorter than {RECORD_HEADER_LEN} bytes")
      }
    }
  }
}

impl std::error::Error for SnoopError {}

impl SnoopHeader {
  /// Parse the 16-byte file header: 8-byte magic, version (u32 BE), datalink type (u32 BE).
  pub fn parse(data: &[u8]) -> Result<SnoopHeader, SnoopError> {
    if data.len() < FILE_HEADER_LEN {
      return Err(SnoopError::ShortHeader);
    }
    let mut magic = [0u8; 8];
    magic.copy_from_slice(&data[..8]);
    Ok(SnoopHeader {
      magic,
      version: unpack_u32_be(&data[8..12]).ok_or(SnoopError::ShortHeader)?,
      datalink: unpack_u32_be(&data[12..16]).ok_or(SnoopError::ShortHeader)?,
    })
  }
}

/// Parsed 24-byte record header. The frame bytes follow on the wire, `included_len` of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
  pub original_len: u32,
  pub included_len: u32,
  pub flags: u32,
  pub drops: u32,
  pub time64: i64,
}

impl RecordHeader {
  /// Parse a record header: four u32 BE fields then an i64 BE timestamp.
  pub fn parse(data: &[u8]) -> Result<RecordHeader, SnoopError> {
    if data.len() < RECORD_HEADER_LEN {
      return Err(SnoopError::ShortRecordHeader);
    }
    Ok(RecordHeader {
      original_len: unpack_u32_be(&data[0..4]).ok_or(SnoopError::ShortRecordHeader)?,
      included_len: unpack_u32_be(&data[4..8]).ok_or(SnoopError::ShortRecordHeader)?,
      flags: unpack_u32_be(&data[8..12]).ok_or(SnoopError::ShortRecordHeader)?,
      drops: unpack_u32_be(&data[12..16]).ok_or(SnoopError::ShortRecordHeader)?,
      time64: unpack_i64_be(&data[16..24]).ok_or(SnoopError::ShortRecordHeader)?,
    })
  }

  /// Resolve the record timestamp to wall-clock time.
  ///
  /// Values outside the range normal date arithmetic can express yield `None`; a record is never
  /// rejected over its timestamp.
  pub fn timestamp(&self) -> Option<SystemTime> {
    let since_2000 = self.time64.checked_sub(EPOCH_2000_OFFSET_MICROS)?;
    let unix_micros = since_2000.checked_add(EPOCH_2000_UNIX_SECS.checked_mul(1_000_000)?)?;
    if unix_micros >= 0 {
      UNIX_EPOCH.checked_add(Duration::from_micros(unix_micros as u64))
    } else {
      UNIX_EPOCH.checked_sub(Duration::from_micros(unix_micros.unsigned_abs()))
    }
  }
}
