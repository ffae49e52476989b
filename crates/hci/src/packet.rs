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

//! HCI frame model and parser.
//!
//! Frames arriving on the snoop stream are H4-framed: a one-byte packet type followed by the
//! type-specific header and payload. The parser decodes them into the [`HciPacket`] sum.

use bytes::Bytes;
use core::fmt;

use crate::codec::{self, unpack_u16_le};

/// Event code for Command Complete.
pub const EVT_COMMAND_COMPLETE: u8 = 0x0E;

/// Event code for vendor-specific debug events.
pub const EVT_VENDOR: u8 = 0xFF;

/// A decoded HCI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciPacket {
  /// Host-to-controller command.
  Command { opcode: u16, payload: Bytes },

  /// Controller-to-host event.
  Event { event_code: u8, data: Bytes },

  /// ACL data, either direction.
  Acl { handle: u16, flags: u8, data: Bytes },

  /// SCO data, either direction.
  Sco { handle: u16, data: Bytes },
}

/// Frame decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
  Empty,
  Truncated,
  UnknownType(u8),
}

impl fmt::Display for PacketError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PacketError::Empty => write!(f, "empty HCI frame"),
      PacketError::Truncated => write!(f, "truncated HCI frame"),
      PacketError::UnknownType(t) => write!(f, "unknown H4 packet type 0x{t:02X}"),
    }
  }
}

impl std::error::Error for PacketError {}

impl HciPacket {
  /// Decode a raw H4 frame as delivered inside a btsnoop record.
  pub fn parse(frame: &[u8]) -> Result<HciPacket, PacketError> {
    let (&packet_type, rest) = frame.split_first().ok_or(PacketError::Empty)?;
    match packet_type {
      codec::H4_COMMAND => {
        if rest.len() < 3 {
          return Err(PacketError::Truncated);
        }
        let opcode = unpack_u16_le(rest).ok_or(PacketError::Truncated)?;
        let param_len = rest[2] as usize;
        let params = rest.get(3..3 + param_len).ok_or(PacketError::Truncated)?;
        Ok(HciPacket::Command {
          opcode,
          payload: Bytes::copy_from_slice(params),
        })
      }
      codec::H4_ACL => {
        if rest.len() < 4 {
          return Err(PacketError::Truncated);
        }
        let handle_flags = unpack_u16_le(rest).ok_or(PacketError::Truncated)?;
        let data_len = unpack_u16_le(&rest[2..]).ok_or(PacketError::Truncated)? as usize;
        let data = rest.get(4..4 + data_len).ok_or(PacketError::Truncated)?;
        Ok(HciPacket::Acl {
          handle: handle_flags & 0x0FFF,
          flags: (handle_flags >> 12) as u8,
          data: Bytes::copy_from_slice(data),
        })
      }
      codec::H4_SCO => {
        if rest.len() < 3 {
          return Err(PacketError::Truncated);
        }
        let handle = unpack_u16_le(rest).ok_or(PacketError::Truncated)? & 0x0FFF;
        let data_len = rest[2] as usize;
        let data = rest.get(3..3 + data_len).ok_or(PacketError::Truncated)?;
        Ok(HciPacket::Sco {
          handle,
          data: Bytes::copy_from_slice(data),
        })
      }
      codec::H4_EVENT => {
        if rest.len() < 2 {
          return Err(PacketError::Truncated);
        }
        let event_code = rest[0];
        let data_len = rest[1] as usize;
        let data = rest.get(2..2 + data_len).ok_or(PacketError::Truncated)?;
        Ok(HciPacket::Event {
          event_code,
          data: Bytes::copy_from_slice(data),
        })
      }
      other => Err(PacketError::UnknownType(other)),
    }
  }

  /// Whether this frame is the Command Complete event for `opcode`.
  ///
  /// The event payload echoes the originating opcode in bytes `[1..3]`, little-endian, right
  /// after the credit count byte.
  pub fn is_command_complete(&self, opcode: u16) -> bool {
    match self {
      HciPacket::Event { event_code, data } if *event_code == EVT_COMMAND_COMPLETE => {
        data.get(1..3).and_then(unpack_u16_le) == Some(opcode)
      }
      _ => false,
    }
  }

  /// The event payload, when this frame is an event.
  pub fn event_data(&self) -> Option<&Bytes> {
    match self {
      HciPacket::Event { data, .. } => Some(data),
      _ => None,
    }
  }
}

impl fmt::Display for HciPacket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      HciPacket::Command { opcode, payload } => {
        write!(f, "CMD opcode=0x{opcode:04X} len={}", payload.len())
      }
      HciPacket::Event { event_code, data } => {
        write!(f, "EVT code=0x{event_code:02X} len={}", data.len())
      }
      HciPacket::Acl { handle, data, .. } => {
        write!(f, "ACL handle=0x{handle:03X} len={}", data.len())
      }
      HciPacket::Sco { handle, data } => {
        write!(f, "SCO handle=0x{handle:03X} len={}", data.len())
      }
    }
  }
}
