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

//! Connection inspection and crafted LMP transmission.
//!
//! Sending a packet works by staging it in scratch RAM next to a small injected routine that
//! allocates a transmit buffer, copies the packet in, resolves the connection struct and tails
//! into the firmware's own LMP send path.

use log::debug;

use firmware::{connection, FirmwareConstants};
use hci::codec::unpack_u32_le;

use crate::error::{Error, Result};
use crate::session::Session;

/// Largest staged LMP packet; the injected routine copies exactly this many bytes.
const STAGED_PACKET_LEN: usize = 20;

/// Escape opcode opening the extended LMP opcode space.
const EXTENDED_ESCAPE: u8 = 0x7F;

/// One decoded connection struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
  /// Firmware connection number.
  pub connection_number: u32,

  /// Peer address in display order.
  pub remote_address: [u8; 6],

  /// RAM address of the remote name string.
  pub remote_name_address: u32,

  /// Whether our device is master of the link.
  pub master_of_connection: bool,
}

impl Session {
  /// Read and decode one connection struct; `None` when the slot is vacant (all zeroes).
  pub fn read_connection_information(&self, connection_number: u8) -> Result<Option<ConnectionInfo>> {
    let fw = self.firmware();
    check_connection_number(fw, connection_number)?;
    let base = fw.connection_array_address
      + (connection_number as u32 - 1) * fw.connection_struct_length;
    let raw = self.read_mem(base, fw.connection_struct_length)?;
    if raw.len() < connection::NAME_POINTER_OFFSET + 4 {
      return Err(Error::TransportLost("truncated connection struct read".to_owned()));
    }
    if raw.iter().all(|&byte| byte == 0) {
      return Ok(None);
    }

    let mut remote_address = [0u8; 6];
    for (idx, byte) in raw[connection::ADDRESS_OFFSET..connection::ADDRESS_OFFSET + 6]
      .iter()
      .rev()
      .enumerate()
    {
      remote_address[idx] = *byte;
    }
    let flags = unpack_u32_le(&raw[connection::FLAGS_OFFSET..]).unwrap_or(0);
    Ok(Some(ConnectionInfo {
      connection_number: unpack_u32_le(&raw[connection::NUMBER_OFFSET..]).unwrap_or(0),
      remote_address,
      remote_name_address: unpack_u32_le(&raw[connection::NAME_POINTER_OFFSET..]).unwrap_or(0),
      master_of_connection: flags & connection::MASTER_FLAG != 0,
    }))
  }

  /// Transmit a crafted LMP packet on an active connection.
  ///
  /// `extended_op` selects the extended opcode space; the transaction id is derived from the
  /// link's master flag.
  pub fn send_lmp_packet(
    &self,
    connection_number: u8,
    opcode: u8,
    payload: &[u8],
    extended_op: bool,
  ) -> Result<()> {
    let fw = *self.firmware();
    check_connection_number(&fw, connection_number)?;
    if !extended_op && opcode > EXTENDED_ESCAPE {
      return Err(Error::Misuse(format!(
        "primary LMP opcode 0x{opcode:02X} out of range"
      )));
    }
    let assembler = self
      .assembler()
      .ok_or_else(|| Error::Assembler("no thumb assembler bound".to_owned()))?;

    let info = self
      .read_connection_information(connection_number)?
      .ok_or_else(|| Error::Misuse(format!("connection {connection_number} is not active")))?;
    let tid = info.master_of_connection as u8;

    let mut packet = Vec::with_capacity(2 + payload.len());
    if extended_op {
      packet.push(EXTENDED_ESCAPE << 1 | tid);
      packet.push(opcode);
    } else {
      packet.push(opcode << 1 | tid);
    }
    packet.extend_from_slice(payload);
    if packet.len() > STAGED_PACKET_LEN {
      return Err(Error::Misuse(format!(
        "LMP packet of {} bytes exceeds the {STAGED_PACKET_LEN}-byte staging area",
        packet.len()
      )));
    }
    packet.resize(STAGED_PACKET_LEN, 0);

    let code = assembler
      .assemble(&send_routine_source(&fw, connection_number), fw.scratch_code_address)
      .map_err(|err| Error::Assembler(format!("{err:#}")))?;
    debug!(
      "staging LMP opcode 0x{opcode:02X} for connection {connection_number} at 0x{:06X}",
      fw.scratch_code_address
    );
    self.write_mem(fw.scratch_code_address, &code)?;
    self.write_mem(fw.scratch_data_address, &packet)?;
    self.launch_ram(fw.scratch_code_address)
  }
}

fn check_connection_number(fw: &FirmwareConstants, connection_number: u8) -> Result<()> {
  if connection_number < 1 || connection_number > fw.connection_array_size {
    return Err(Error::Misuse(format!(
      "connection number {connection_number} out of bounds (1..={})",
      fw.connection_array_size
    )));
  }
  Ok(())
}

/// Thumb source of the one-shot transmit routine: allocate a zeroed 0x20 buffer, copy the staged
/// packet to offset 0xC, resolve the connection struct, tail into the firmware send path.
fn send_routine_source(fw: &FirmwareConstants, connection_number: u8) -> String {
  format!(
    r#"
    push {{r4, lr}}

    @ zeroed transmit buffer
    bl   0x{alloc:X}
    mov  r4, r0

    @ staged packet into buffer+0xC
    add  r0, 0xC
    ldr  r1, =0x{staged:X}
    mov  r2, {staged_len}
    bl   0x{memcpy:X}

    @ connection struct for this link
    mov  r0, {conn}
    bl   0x{find_conn:X}

    mov  r1, r4
    pop  {{r4, lr}}
    b    0x{send:X}
"#,
    alloc = fw.alloc_lmp_block_address,
    staged = fw.scratch_data_address,
    staged_len = STAGED_PACKET_LEN,
    memcpy = fw.memcpy_address,
    conn = connection_number,
    find_conn = fw.find_connection_address,
    send = fw.send_lmp_packet_address,
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use firmware::BCM4339;

  #[test]
  fn test_send_routine_source_embeds_connection() {
    let source = send_routine_source(&BCM4339, 3);
    assert!(source.contains("mov  r0, 3"));
    assert!(source.contains(&format!("0x{:X}", BCM4339.scratch_data_address)));
    assert!(source.contains(&format!("0x{:X}", BCM4339.send_lmp_packet_address)));
  }

  #[test]
  fn test_check_connection_number_bounds() {
    assert!(check_connection_number(&BCM4339, 0).is_err());
    assert!(check_connection_number(&BCM4339, 1).is_ok());
    assert!(check_connection_number(&BCM4339, BCM4339.connection_array_size).is_ok());
    assert!(check_connection_number(&BCM4339, BCM4339.connection_array_size + 1).is_err());
  }
}
