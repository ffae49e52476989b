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

//! Controller memory access.
//!
//! Reads, writes and code launches ride on the vendor HCI commands; ROM patches go through the
//! chip's patchram tables. The host-side slot bitmap is the authoritative view of which slots
//! this tool has claimed; the chip's enable bitfield is written only from here.

use bytes::Bytes;
use log::warn;
use std::time::Duration;

use firmware::PatchramLayout;
use hci::codec::pack_u32_le;

use crate::error::{Error, Result};
use crate::session::Session;

/// Vendor command: read controller RAM.
pub const VSC_READ_RAM: u16 = 0xFC4D;

/// Vendor command: write controller RAM.
pub const VSC_WRITE_RAM: u16 = 0xFC4C;

/// Vendor command: branch into controller RAM.
pub const VSC_LAUNCH_RAM: u16 = 0xFC4E;

/// Largest chunk moved by one vendor command.
const MAX_CHUNK: u32 = 251;

/// Deadline for one memory-access round trip.
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// One controller read, with the per-chunk status the controller reported.
#[derive(Debug, Clone)]
pub struct MemChunk {
  /// Address the chunk was read from.
  pub addr: u32,

  /// Controller status byte; zero means success.
  pub status: u8,

  /// Chunk payload.
  pub data: Bytes,
}

/// Claim on one patchram slot, handed out by [`Session::patch_rom`].
#[derive(Debug, PartialEq, Eq)]
pub struct PatchSlot(pub(crate) u8);

impl PatchSlot {
  /// Slot index inside the patchram tables.
  pub fn index(&self) -> u8 {
    self.0
  }
}

impl Session {
  /// Read controller memory in vendor-command chunks, surfacing the status of each chunk.
  pub fn read_mem_chunked(&self, address: u32, length: u32) -> Result<Vec<MemChunk>> {
    self.check_running()?;
    let end = address
      .checked_add(length)
      .ok_or_else(|| Error::Misuse("read range wraps the address space".to_owned()))?;
    let mut chunks = Vec::new();
    let mut addr = address;
    while addr < end {
      let blocksize = (end - addr).min(MAX_CHUNK) as u8;
      let mut params = Vec::with_capacity(5);
      params.extend_from_slice(&pack_u32_le(addr));
      params.push(blocksize);
      let response = self.send_hci_command(VSC_READ_RAM, &params, COMMAND_TIMEOUT)?;
      if response.len() < 4 {
        return Err(Error::TransportLost("truncated read response".to_owned()));
      }
      let status = response[3];
      let data = response.slice(4..);
      let advanced = data.len() as u32;
      chunks.push(MemChunk { addr, status, data });
      if advanced == 0 {
        warn!("read at 0x{addr:08X} returned no data (status 0x{status:02X}); giving up");
        break;
      }
      addr += advanced;
    }
    Ok(chunks)
  }

  /// Read `length` bytes at `address`.
  ///
  /// Chunks reporting a nonzero status are logged and their bytes still concatenated, so a
  /// partial failure yields a best-effort buffer; use [`Session::read_mem_chunked`] to decide
  /// per chunk.
  pub fn read_mem(&self, address: u32, length: u32) -> Result<Vec<u8>> {
    let chunks = self.read_mem_chunked(address, length)?;
    let mut out = Vec::with_capacity(length as usize);
    for chunk in &chunks {
      if chunk.status != 0 {
        warn!(
          "memory read at 0x{:08X} carries status 0x{:02X}",
          chunk.addr, chunk.status
        );
      }
      out.extend_from_slice(&chunk.data);
    }
    Ok(out)
  }

  /// Write `data` to controller memory at `address`, aborting on the first rejected chunk.
  pub fn write_mem(&self, address: u32, data: &[u8]) -> Result<()> {
    self.check_running()?;
    let mut offset = 0usize;
    while offset < data.len() {
      let blocksize = (data.len() - offset).min(MAX_CHUNK as usize);
      let addr = address
        .checked_add(offset as u32)
        .ok_or_else(|| Error::Misuse("write range wraps the address space".to_owned()))?;
      let mut params = Vec::with_capacity(4 + blocksize);
      params.extend_from_slice(&pack_u32_le(addr));
      params.extend_from_slice(&data[offset..offset + blocksize]);
      let response = self.send_hci_command(VSC_WRITE_RAM, &params, COMMAND_TIMEOUT)?;
      let status = *response.get(3).unwrap_or(&0xFF);
      if status != 0 {
        return Err(Error::CommandStatus {
          opcode: VSC_WRITE_RAM,
          status,
        });
      }
      offset += blocksize;
    }
    Ok(())
  }

  /// Execute code at `address` inside the controller.
  pub fn launch_ram(&self, address: u32) -> Result<()> {
    self.check_running()?;
    let response = self.send_hci_command(VSC_LAUNCH_RAM, &pack_u32_le(address), COMMAND_TIMEOUT)?;
    let status = *response.get(3).unwrap_or(&0xFF);
    if status != 0 {
      return Err(Error::CommandStatus {
        opcode: VSC_LAUNCH_RAM,
        status,
      });
    }
    Ok(())
  }

  /// Redirect the 4-byte ROM word at `address` to `patch`.
  ///
  /// Allocates the lowest free patchram slot, writes the patch value and target tables, and
  /// flushes the affected enable word. The returned handle releases the slot through
  /// [`Session::disable_rom_patch`].
  pub fn patch_rom(&self, address: u32, patch: &[u8; 4]) -> Result<PatchSlot> {
    self.check_running()?;
    if address % 4 != 0 {
      return Err(Error::Misuse(format!(
        "patch target 0x{address:08X} is not 4-byte aligned"
      )));
    }
    let layout = self.firmware().patchram;
    let mut table = self.patchram_table();
    let slot = table
      .lowest_free()
      .ok_or_else(|| Error::Misuse("no free patchram slot".to_owned()))?;

    self.write_mem(layout.value_table + slot as u32 * 4, patch)?;
    self.write_mem(
      layout.target_table + slot as u32 * 4,
      &pack_u32_le(address >> 2),
    )?;

    table.set(slot);
    let (word_index, word) = table.enable_word(slot);
    if let Err(err) = self.write_mem(layout.enable_base + word_index as u32 * 4, &pack_u32_le(word)) {
      table.clear(slot);
      return Err(err);
    }
    Ok(PatchSlot(slot))
  }

  /// Release a patchram slot: clear its enable bit and flush the affected word back.
  pub fn disable_rom_patch(&self, slot: PatchSlot) -> Result<()> {
    self.check_running()?;
    let layout = self.firmware().patchram;
    let mut table = self.patchram_table();
    table.clear(slot.0);
    let (word_index, word) = table.enable_word(slot.0);
    self.write_mem(layout.enable_base + word_index as u32 * 4, &pack_u32_le(word))
  }
}

/// Host-side mirror of the patchram enable bitfield.
pub(crate) struct PatchramTable {
  words: [u32; 5],
  slot_count: u8,
}

impl PatchramTable {
  pub fn new(layout: &PatchramLayout) -> PatchramTable {
    PatchramTable {
      words: layout.factory_mask,
      slot_count: layout.slot_count,
    }
  }

  /// Lowest slot not yet claimed by the factory patch set or this tool.
  pub fn lowest_free(&self) -> Option<u8> {
    (0..self.slot_count).find(|&slot| !self.is_set(slot))
  }

  pub fn is_set(&self, slot: u8) -> bool {
    self.words[slot as usize / 32] & (1 << (slot % 32)) != 0
  }

  pub fn set(&mut self, slot: u8) {
    self.words[slot as usize / 32] |= 1 << (slot % 32);
  }

  pub fn clear(&mut self, slot: u8) {
    self.words[slot as usize / 32] &= !(1 << (slot % 32));
  }

  /// The enable word covering `slot`, as (index, value).
  pub fn enable_word(&self, slot: u8) -> (usize, u32) {
    let index = slot as usize / 32;
    (index, self.words[index])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use firmware::BCM4339;

  #[test]
  fn test_factory_mask_leaves_slot_112_free() {
    let table = PatchramTable::new(&BCM4339.patchram);
    assert_eq!(table.lowest_free(), Some(112));
  }

  #[test]
  fn test_allocation_scans_forward() {
    let mut table = PatchramTable::new(&BCM4339.patchram);
    table.set(112);
    assert_eq!(table.lowest_free(), Some(113));
    table.set(113);
    assert_eq!(table.lowest_free(), Some(114));
    table.clear(112);
    assert_eq!(table.lowest_free(), Some(112));
  }

  #[test]
  fn test_enable_word_tracks_slot_bits() {
    let mut table = PatchramTable::new(&BCM4339.patchram);
    table.set(112);
    let (index, word) = table.enable_word(112);
    assert_eq!(index, 3);
    assert_eq!(word, 0x0001_FFFF);
    table.clear(112);
    assert_eq!(table.enable_word(112).1, 0x0000_FFFF);
  }

  #[test]
  fn test_exhaustion_reports_none() {
    let mut table = PatchramTable::new(&BCM4339.patchram);
    while let Some(slot) = table.lowest_free() {
      table.set(slot);
    }
    assert_eq!(table.lowest_free(), None);
    // all claims sit below the usable slot count
    assert!(table.is_set(BCM4339.patchram.slot_count - 1));
  }
}
