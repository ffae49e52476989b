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

//! Firmware-side knowledge for the supported Broadcom controllers: ROM/RAM addresses, the
//! connection struct layout, patchram geometry, and the LMP opcode length tables, plus the
//! binding to an external thumb assembler.

pub mod asm;
pub mod lmp;

pub use asm::{Assembler, GnuAssembler};

/// Patchram geometry: the value table holds one 4-byte replacement word per slot, the target
/// table one word-aligned ROM address (stored `>> 2`) per slot, and the enable bitfield mirrors
/// one bit per slot.
#[derive(Debug, Clone, Copy)]
pub struct PatchramLayout {
  /// Base of the patch value table.
  pub value_table: u32,

  /// Base of the target address table.
  pub target_table: u32,

  /// Base of the enable bitfield.
  pub enable_base: u32,

  /// Number of usable slots.
  pub slot_count: u8,

  /// Enable bits already claimed by the factory patch set.
  pub factory_mask: [u32; 5],
}

/// Address table for one controller firmware build.
///
/// All code injected into the controller is position-dependent, so every supported firmware
/// carries its own copy of this table.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareConstants {
  /// Human-readable firmware build name.
  pub name: &'static str,

  /// Device Bluetooth address in RAM.
  pub bd_addr: u32,

  /// Base of the connection struct array.
  pub connection_array_address: u32,

  /// Number of entries in the connection array.
  pub connection_array_size: u8,

  /// Byte length of one connection struct.
  pub connection_struct_length: u32,

  /// Function pointer word consulted before every outbound LMP packet.
  pub lmp_send_packet_hook: u32,

  /// ROM word patched to divert the LMP receive path into the monitor dispatcher.
  pub lmp_dispatch_patch_address: u32,

  /// Instruction the receive hook returns to after capturing.
  pub lmp_dispatch_return_address: u32,

  /// RAM word pair describing the buffer holding the LMP packet being received.
  pub lmp_receive_buffer_table: u32,

  /// ROM `memcpy` routine.
  pub memcpy_address: u32,

  /// ROM allocator for zeroed 0x20-byte blocks.
  pub alloc_lmp_block_address: u32,

  /// ROM routine resolving a connection number to its connection struct.
  pub find_connection_address: u32,

  /// ROM routine transmitting a prepared LMP packet.
  pub send_lmp_packet_address: u32,

  /// Free RAM where the monitor hook functions are assembled to.
  pub monitor_hook_base: u32,

  /// Free RAM holding the monitor capture ring (u32 counter + 32 entries of 32 bytes).
  pub monitor_ring_base: u32,

  /// Scratch RAM for one-shot injected routines.
  pub scratch_code_address: u32,

  /// Scratch RAM for data consumed by one-shot routines.
  pub scratch_data_address: u32,

  /// Patchram geometry for this chip.
  pub patchram: PatchramLayout,
}

/// Offsets into a connection struct. Layout is dictated by the firmware.
pub mod connection {
  /// Connection number, u32.
  pub const NUMBER_OFFSET: usize = 0x00;

  /// Flags word; bit 15 set means this device is master of the link.
  pub const FLAGS_OFFSET: usize = 0x1C;
  pub const MASTER_FLAG: u32 = 1 << 15;

  /// Peer Bluetooth address, 6 bytes in wire order (reverse for display).
  pub const ADDRESS_OFFSET: usize = 0x28;
  pub const ADDRESS_LEN: usize = 6;

  /// Pointer to the remote name string, u32.
  pub const NAME_POINTER_OFFSET: usize = 0x4C;
}

/// BCM4339 as shipped in the Nexus 5 (BCM4335C0 firmware build).
pub const BCM4339: FirmwareConstants = FirmwareConstants {
  name: "BCM4335C0",
  bd_addr: 0x0021_0C2C,
  connection_array_address: 0x0020_38E8,
  connection_array_size: 11,
  connection_struct_length: 0x14C,
  lmp_send_packet_hook: 0x0020_0D38,
  lmp_dispatch_patch_address: 0x0003_F3F4,
  lmp_dispatch_return_address: 0x0003_F3F8,
  lmp_receive_buffer_table: 0x0020_0478,
  memcpy_address: 0x0002_E03C,
  alloc_lmp_block_address: 0x0003_F17E,
  find_connection_address: 0x0004_2C04,
  send_lmp_packet_address: 0x0000_F81A,
  monitor_hook_base: 0x000D_7600,
  monitor_ring_base: 0x000D_7700,
  scratch_code_address: 0x000D_7500,
  scratch_data_address: 0x000D_7580,
  patchram: PatchramLayout {
    value_table: 0x000D_0000,
    target_table: 0x0031_0000,
    enable_base: 0x0031_0204,
    slot_count: 128,
    // Slots 0..=111 are claimed by the factory patch set on this build.
    factory_mask: [0xFFFF_FFFF, 0xFFFF_FFFF, 0xFFFF_FFFF, 0x0000_FFFF, 0x0000_0000],
  },
};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bcm4339_patchram_geometry() {
    let layout = BCM4339.patchram;
    // The enable bitfield sits right behind the 0x204-byte target table.
    assert_eq!(layout.enable_base - layout.target_table, 0x204);
    assert!(layout.slot_count as usize <= layout.factory_mask.len() * 32);
  }

  #[test]
  fn test_bcm4339_dispatch_addresses_adjacent() {
    // The receive-path patch replaces exactly the word before the return target.
    assert_eq!(
      BCM4339.lmp_dispatch_return_address - BCM4339.lmp_dispatch_patch_address,
      4
    );
    assert_eq!(BCM4339.lmp_dispatch_patch_address % 4, 0);
  }

  #[test]
  fn test_bcm4339_scratch_regions_disjoint() {
    assert!(BCM4339.scratch_data_address > BCM4339.scratch_code_address);
    assert!(BCM4339.monitor_hook_base > BCM4339.scratch_data_address);
    assert!(BCM4339.monitor_ring_base >= BCM4339.monitor_hook_base + 0x100);
  }
}
