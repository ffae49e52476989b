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

//! LMP PDU length tables.
//!
//! LMP carries no explicit length field; the PDU size is implied by the opcode. Opcodes at or
//! above [`ESCAPE_OPCODE_MIN`] select the extended table through the second opcode byte.

/// Lowest opcode treated as an escape into the extended opcode space.
pub const ESCAPE_OPCODE_MIN: u8 = 0x7C;

/// PDU lengths (including the opcode byte) for primary LMP opcodes. Reserved opcodes map to 1 so
/// a captured PDU always at least carries its opcode byte.
const PRIMARY_LENGTHS: [u8; 124] = [
  1, // 0x00 invalid
  2, 17, 2, 3, 1, 3, 2, // name_req .. detach
  17, 17, 17, 17, 5, 17, 17, // in_rand .. temp_key
  2, 2, 17, 1, // encryption_mode_req .. stop_encryption_req
  5, 7, 7, 1, 10, 1, 17, 1, // switch_req .. park_req (22, 26 reserved)
  6, 13, 17, 15, // set_broadcast_scan_window .. unpark_PM_ADDR_req
  2, 2, 1, 1, 1, 2, // incr_power_req .. preferred_rate
  6, 6, 9, 9, // version_req .. features_res
  4, 4, 7, 3, // quality_of_service .. remove_SCO_link_req
  2, 2, 1, 3, // max_slot .. timing_accuracy_res
  1, 1, 1, 9, // setup_complete .. slot_offset
  3, 3, 3, // page_mode_req .. supervision_timeout
  1, 10, // test_activate, test_control
  1, 3, // encryption_key_size_mask_req/res
  16, // set_AFH
  4, 17, // encapsulated_header, encapsulated_payload
  17, 17, 17, // Simple_Pairing_Confirm, Simple_Pairing_Number, DHkey_Check
  17, // pause_encryption_aes_req
  1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 0x43..0x53 reserved
  1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 0x54..0x64 reserved
  1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 0x65..0x75 reserved
  1, 1, 1, 1, 1, 1, // 0x76..0x7B reserved
];

/// PDU lengths (including both opcode bytes) for the extended opcode table.
const ESCAPE_LENGTHS: [u8; 35] = [
  2, // 0x00 invalid
  4, 5, 12, 12, // accepted_ext .. features_res_ext
  16, 3, 6, // clk_adj, clk_adj_ack, clk_adj_req
  2, 2, 2, // 8..10 reserved
  3, 16, 4, // packet_type_table_req, eSCO_link_req, remove_eSCO_link_req
  2, 2, // 14, 15 reserved
  7, 12, // channel_classification_req, channel_classification
  2, 2, 2, // 18..20 reserved
  9, 9, // sniff_subrating_req, sniff_subrating_res
  2, 2, // pause_encryption_req, resume_encryption_req
  4, 4, // IO_capability_req, IO_capability_res
  2, 2, 2, // numeric_comparison_failed, passkey_failed, oob_failed
  3, // keypress_notification
  3, 3, // power_control_req, power_control_res
  2, 2, // ping_req, ping_res
];

/// PDU length for a primary opcode, `None` when out of table range.
pub fn primary_length(opcode: u8) -> Option<usize> {
  PRIMARY_LENGTHS.get(opcode as usize).map(|len| *len as usize)
}

/// PDU length for an extended opcode, `None` when out of table range.
pub fn escape_length(extended_opcode: u8) -> Option<usize> {
  ESCAPE_LENGTHS.get(extended_opcode as usize).map(|len| *len as usize)
}

/// Extract the opcode from the first PDU byte (transaction-id bit stripped).
#[inline]
pub fn opcode_of(first_byte: u8) -> u8 {
  first_byte >> 1
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_primary_lengths_known_opcodes() {
    assert_eq!(primary_length(1), Some(2)); // name_req
    assert_eq!(primary_length(2), Some(17)); // name_res
    assert_eq!(primary_length(37), Some(6)); // version_req
    assert_eq!(primary_length(49), Some(1)); // setup_complete
    assert_eq!(primary_length(60), Some(16)); // set_AFH
  }

  #[test]
  fn test_primary_length_out_of_range() {
    assert_eq!(primary_length(124), None);
    assert_eq!(primary_length(0xFF), None);
  }

  #[test]
  fn test_escape_lengths_known_opcodes() {
    assert_eq!(escape_length(1), Some(4)); // accepted_ext
    assert_eq!(escape_length(12), Some(16)); // eSCO_link_req
    assert_eq!(escape_length(21), Some(9)); // sniff_subrating_req
    assert_eq!(escape_length(33), Some(2)); // ping_req
  }

  #[test]
  fn test_escape_length_out_of_range() {
    assert_eq!(escape_length(35), None);
  }

  #[test]
  fn test_opcode_of_strips_tid() {
    assert_eq!(opcode_of(0x25 << 1 | 1), 0x25);
    assert_eq!(opcode_of(0x25 << 1), 0x25);
    assert!(opcode_of(0x7F << 1 | 1) >= ESCAPE_OPCODE_MIN);
  }

  #[test]
  fn test_table_sizes_cover_opcode_space() {
    // Primary table covers every opcode below the escape range.
    assert_eq!(PRIMARY_LENGTHS.len(), ESCAPE_OPCODE_MIN as usize);
    // No PDU exceeds the 24 bytes captured per ring entry.
    assert!(PRIMARY_LENGTHS.iter().all(|&len| len as usize <= 24));
    assert!(ESCAPE_LENGTHS.iter().all(|&len| len as usize <= 24));
  }
}
