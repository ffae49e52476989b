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

//! Fixed-endian wire codecs.
//!
//! HCI payload fields are little-endian; btsnoop record headers are big-endian. Everything in this
//! module is a thin, panic-free packer/unpacker over those two byte orders, plus the builder for
//! the framed HCI command written to the injection socket.

use bytes::{BufMut, Bytes, BytesMut};

/// H4 packet type carried as the first byte of every injected frame.
pub const H4_COMMAND: u8 = 0x01;

/// H4 packet type for ACL data frames.
pub const H4_ACL: u8 = 0x02;

/// H4 packet type for SCO data frames.
pub const H4_SCO: u8 = 0x03;

/// H4 packet type for event frames.
pub const H4_EVENT: u8 = 0x04;

/// Pack a `u16` as little-endian (HCI field order).
#[inline]
pub fn pack_u16_le(value: u16) -> [u8; 2] {
  value.to_le_bytes()
}

/// Pack a `u32` as little-endian (HCI field order).
#[inline]
pub fn pack_u32_le(value: u32) -> [u8; 4] {
  value.to_le_bytes()
}

/// Unpack a little-endian `u16` from the start of `data`.
#[inline]
pub fn unpack_u16_le(data: &[u8]) -> Option<u16> {
  Some(u16::from_le_bytes([*data.first()?, *data.get(1)?]))
}

/// Unpack a little-endian `u32` from the start of `data`.
#[inline]
pub fn unpack_u32_le(data: &[u8]) -> Option<u32> {
  let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
  Some(u32::from_le_bytes(bytes))
}

/// Unpack a big-endian `u32` from the start of `data` (btsnoop header order).
#[inline]
pub fn unpack_u32_be(data: &[u8]) -> Option<u32> {
  let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
  Some(u32::from_be_bytes(bytes))
}

/// Unpack a big-endian `i64` from the start of `data` (btsnoop timestamp order).
#[inline]
pub fn unpack_i64_be(data: &[u8]) -> Option<i64> {
  let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
  Some(i64::from_be_bytes(bytes))
}

/// Build the framed HCI command written to the injection socket.
///
/// Layout: `type (0x01) | total_len u16 LE | opcode u16 LE | param_len u8 | params`. The inner
/// `param_len` byte repeats information the outer frame length already carries; the HCI command
/// encoding mandates it regardless.
pub fn build_command_frame(opcode: u16, params: &[u8]) -> Bytes {
  debug_assert!(params.len() <= u8::MAX as usize);
  let payload_len = 2 + 1 + params.len();
  let mut frame = BytesMut::with_capacity(3 + payload_len);
  frame.put_u8(H4_COMMAND);
  frame.put_u16_le(payload_len as u16);
  frame.put_u16_le(opcode);
  frame.put_u8(params.len() as u8);
  frame.put_slice(params);
  frame.freeze()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_pack_unpack_u16_le() {
    assert_eq!(pack_u16_le(0xFC4D), [0x4D, 0xFC]);
    assert_eq!(unpack_u16_le(&[0x4D, 0xFC]), Some(0xFC4D));
    assert_eq!(unpack_u16_le(&[0x4D]), None);
  }

  #[test]
  fn test_pack_unpack_u32_le() {
    assert_eq!(pack_u32_le(0x000D7600), [0x00, 0x76, 0x0D, 0x00]);
    assert_eq!(unpack_u32_le(&[0x00, 0x76, 0x0D, 0x00]), Some(0x000D7600));
    assert_eq!(unpack_u32_le(&[0x00, 0x76]), None);
  }

  #[test]
  fn test_unpack_u32_be() {
    assert_eq!(unpack_u32_be(&[0x00, 0x00, 0x00, 0x01]), Some(1));
    assert_eq!(unpack_u32_be(&[0xDE, 0xAD, 0xBE, 0xEF]), Some(0xDEADBEEF));
  }

  #[test]
  fn test_unpack_i64_be() {
    let stamp: i64 = 0x00E03AB44A676000;
    assert_eq!(unpack_i64_be(&stamp.to_be_bytes()), Some(stamp));
    assert_eq!(unpack_i64_be(&[0; 7]), None);
  }

  #[test]
  fn test_build_command_frame_layout() {
    let frame = build_command_frame(0xFC4D, &[0xEF, 0xBE, 0x20, 0x00, 0x04]);
    // type, total length (opcode + plen + 5 params = 8), opcode LE, plen, params
    assert_eq!(
      frame.as_ref(),
      &[0x01, 0x08, 0x00, 0x4D, 0xFC, 0x05, 0xEF, 0xBE, 0x20, 0x00, 0x04]
    );
  }

  #[test]
  fn test_build_command_frame_empty_params() {
    let frame = build_command_frame(0x0C03, &[]);
    assert_eq!(frame.as_ref(), &[0x01, 0x03, 0x00, 0x03, 0x0C, 0x00]);
  }
}
