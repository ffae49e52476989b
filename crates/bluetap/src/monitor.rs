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

//! Live LMP traffic monitor.
//!
//! Two thumb hooks are injected into the running firmware: the send hook rides the firmware's
//! LMP transmit function pointer, the receive hook a patchram diversion of the receive path.
//! Both append 32-byte entries to a circular capture table in controller RAM: a u32 tag (high
//! bit = sent by device, low 31 bits a shared sequence number) followed by 28 payload bytes.
//! The host polls the table, reassembles entries in sequence order across wrap-around, resolves
//! peer addresses through the connection array, and hands finished packets to a callback.
//! Firmware writes the tag's counter before the entry body, so a torn entry shows a stale tag
//! and is simply picked up on a later poll.

use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use firmware::lmp::{escape_length, opcode_of, primary_length, ESCAPE_OPCODE_MIN};
use firmware::{connection, FirmwareConstants};
use hci::codec::{pack_u32_le, unpack_u32_le};

use crate::error::{Error, Result};
use crate::memory::PatchSlot;
use crate::session::Session;

/// Entries in the capture ring.
pub const RING_ENTRIES: u32 = 32;

/// Bytes per ring entry: u32 tag + 28 payload bytes.
pub const RING_ENTRY_LEN: u32 = 32;

/// Mask extracting the sequence number from an entry tag.
const SEQ_MASK: u32 = 0x7FFF_FFFF;

/// Tag bit marking a packet sent by the device.
const SENT_FLAG: u32 = 0x8000_0000;

/// Upper bound of the idle polling backoff.
const MAX_POLL_WAIT: Duration = Duration::from_millis(500);

/// LMP payload bytes captured per entry.
const CAPTURED_PAYLOAD: usize = 24;

/// Monitor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
  Inactive = 0,
  Installing = 1,
  Running = 2,
  Uninstalling = 3,
}

impl MonitorState {
  pub(crate) fn from_u8(value: u8) -> MonitorState {
    match value {
      1 => MonitorState::Installing,
      2 => MonitorState::Running,
      3 => MonitorState::Uninstalling,
      _ => MonitorState::Inactive,
    }
  }
}

/// One reassembled LMP packet.
#[derive(Debug, Clone)]
pub struct LmpEvent {
  /// The LMP PDU, starting at the opcode byte.
  pub packet: Bytes,

  /// Direction: `true` when our controller transmitted the packet.
  pub sent_by_device: bool,

  /// Address of the transmitting side.
  pub source: [u8; 6],

  /// Address of the receiving side.
  pub destination: [u8; 6],

  /// Firmware connection number the packet belongs to.
  pub connection_number: u8,

  /// Capture sequence number, shared across both directions.
  pub sequence: u32,
}

/// Callback receiving monitored packets, in firmware emission order.
pub type LmpCallback = Box<dyn FnMut(&LmpEvent) + Send>;

impl Session {
  /// Install the firmware hooks and start delivering LMP traffic to `callback`.
  ///
  /// The hook code is assembled on the calling thread; workers never invoke external tools.
  pub fn start_monitor(&self, callback: LmpCallback) -> Result<()> {
    self.check_running()?;
    let assembler = self
      .assembler()
      .ok_or_else(|| Error::Assembler("no thumb assembler bound".to_owned()))?;
    if self.monitor_handle_active() {
      return Err(Error::Misuse("monitor is already active".to_owned()));
    }

    let fw = self.firmware();
    let hook_code = assembler
      .assemble(&hook_source(fw), fw.monitor_hook_base)
      .map_err(|err| Error::Assembler(format!("{err:#}")))?;
    let branch = assembler
      .assemble(
        &format!("b 0x{:X}", fw.monitor_hook_base + 5),
        fw.lmp_dispatch_patch_address,
      )
      .map_err(|err| Error::Assembler(format!("{err:#}")))?;
    let branch: [u8; 4] = branch
      .as_slice()
      .try_into()
      .map_err(|_| Error::Assembler("dispatch branch must assemble to one 4-byte word".to_owned()))?;

    self.reset_monitor_exit();
    let worker = MonitorWorker {
      session: self.clone(),
      callback,
      hook_code,
      branch,
    };
    self.spawn_monitor(worker)
  }

  /// Request monitor teardown and wait for it, unless called from the monitor callback itself.
  pub fn stop_monitor(&self) -> Result<()> {
    self.request_monitor_exit();
    let Some(handle) = self.take_monitor_handle() else {
      return Err(Error::Misuse("monitor is not active".to_owned()));
    };
    if thread::current().id() == handle.thread_id {
      debug!("monitor stop requested from its own thread; skipping join");
      return Ok(());
    }
    if handle.worker.join().is_err() {
      warn!("monitor worker panicked");
    }
    Ok(())
  }
}

/// Firmware state captured before installation, for restore at teardown.
struct InstalledHooks {
  saved_hooks: Vec<u8>,
  saved_ring: Vec<u8>,
  recv_patch: PatchSlot,
}

pub(crate) struct MonitorWorker {
  pub(crate) session: Session,
  pub(crate) callback: LmpCallback,
  pub(crate) hook_code: Vec<u8>,
  pub(crate) branch: [u8; 4],
}

impl MonitorWorker {
  pub(crate) fn run(mut self) {
    self.session.set_monitor_state(MonitorState::Installing);
    let installed = match self.install() {
      Ok(installed) => installed,
      Err(err) => {
        error!("monitor install failed: {err}");
        self.session.clear_monitor_handle();
        self.session.set_monitor_state(MonitorState::Inactive);
        return;
      }
    };
    info!("LMP monitor active");
    self.session.set_monitor_state(MonitorState::Running);

    let device_address = match self.session.read_mem(self.session.firmware().bd_addr, 6) {
      Ok(raw) if raw.len() == 6 => {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&raw);
        addr
      }
      other => {
        warn!("could not read own device address ({other:?})");
        [0u8; 6]
      }
    };

    self.poll(&device_address);

    self.session.set_monitor_state(MonitorState::Uninstalling);
    self.uninstall(installed);
    self.session.clear_monitor_handle();
    self.session.set_monitor_state(MonitorState::Inactive);
    debug!("monitor worker terminated");
  }

  /// Save firmware state, plant the capture ring and both hooks.
  fn install(&self) -> Result<InstalledHooks> {
    let fw = *self.session.firmware();
    let saved_hooks = self.session.read_mem(fw.monitor_hook_base, self.hook_code.len() as u32)?;
    let saved_ring = self.session.read_mem(fw.monitor_ring_base, 4)?;
    self.session.write_mem(fw.monitor_ring_base, &pack_u32_le(0))?;
    debug!("injecting monitor hooks at 0x{:06X}", fw.monitor_hook_base);
    self.session.write_mem(fw.monitor_hook_base, &self.hook_code)?;
    self
      .session
      .write_mem(fw.lmp_send_packet_hook, &pack_u32_le(fw.monitor_hook_base | 1))?;
    let recv_patch = self
      .session
      .patch_rom(fw.lmp_dispatch_patch_address, &self.branch)?;
    Ok(InstalledHooks {
      saved_hooks,
      saved_ring,
      recv_patch,
    })
  }

  /// Remove the hooks and restore saved firmware state. After a controller crash these writes
  /// are expected to fail; every step is attempted regardless.
  fn uninstall(&self, installed: InstalledHooks) {
    let fw = *self.session.firmware();
    if let Err(err) = self.session.write_mem(fw.lmp_send_packet_hook, &pack_u32_le(0)) {
      warn!("could not clear LMP send hook: {err}");
    }
    if let Err(err) = self.session.disable_rom_patch(installed.recv_patch) {
      warn!("could not disable LMP receive patch: {err}");
    }
    if let Err(err) = self.session.write_mem(fw.monitor_hook_base, &installed.saved_hooks) {
      warn!("could not restore hook region: {err}");
    }
    if let Err(err) = self.session.write_mem(fw.monitor_ring_base, &installed.saved_ring) {
      warn!("could not restore ring state: {err}");
    }
  }

  fn should_exit(&self) -> bool {
    self.session.exit_flag().load(Ordering::SeqCst)
      || self.session.monitor_exit_flag().load(Ordering::SeqCst)
  }

  /// Poll the capture ring until cancellation.
  fn poll(&mut self, device_address: &[u8; 6]) {
    let fw = *self.session.firmware();
    let mut last: u32 = 0;
    let mut wait = MAX_POLL_WAIT;

    while !self.should_exit() {
      let current = match self.session.read_mem(fw.monitor_ring_base, 4) {
        Ok(raw) => match unpack_u32_le(&raw) {
          Some(counter) => counter & SEQ_MASK,
          None => {
            warn!("short ring counter read; retrying");
            thread::sleep(Duration::from_millis(100));
            continue;
          }
        },
        Err(err) => {
          warn!("ring counter read failed: {err}; retrying");
          thread::sleep(Duration::from_millis(100));
          continue;
        }
      };

      if current <= last {
        thread::sleep(wait);
        if wait < MAX_POLL_WAIT {
          wait = (wait + MAX_POLL_WAIT / 10).min(MAX_POLL_WAIT);
        }
        continue;
      }
      wait = Duration::ZERO;

      let mut raw = Vec::new();
      let mut failed = false;
      for (first_entry, count) in ring_read_spans(last, current) {
        let addr = fw.monitor_ring_base + 4 + first_entry * RING_ENTRY_LEN;
        match self.session.read_mem(addr, count * RING_ENTRY_LEN) {
          Ok(bytes) => raw.extend_from_slice(&bytes),
          Err(err) => {
            warn!("ring entry read failed: {err}; retrying");
            failed = true;
            break;
          }
        }
      }
      if failed {
        continue;
      }

      let mut entries = parse_ring_entries(&raw);
      entries.sort_by_key(|entry| entry.tag & SEQ_MASK);
      last = self.deliver(entries, last, current, device_address);
    }
  }

  /// Hand ordered entries to the callback; returns the new high-water sequence number.
  fn deliver(
    &mut self,
    entries: Vec<RingEntry>,
    mut last: u32,
    current: u32,
    device_address: &[u8; 6],
  ) -> u32 {
    let mut peers: HashMap<u8, [u8; 6]> = HashMap::new();
    for entry in entries {
      let sequence = entry.tag & SEQ_MASK;
      if sequence <= last {
        if entry.tag != 0 {
          warn!("out-of-order ring entry (sequence {sequence}, already at {last})");
        }
        continue;
      }
      // the firmware may have bumped the counter again mid-read; leave it to the next poll
      if sequence > current {
        continue;
      }

      let sent_by_device = entry.tag & SENT_FLAG != 0;
      let connection_number = entry.payload[2];
      let first_byte = entry.payload[4];
      let opcode = opcode_of(first_byte);
      let length = if opcode >= ESCAPE_OPCODE_MIN {
        escape_length(entry.payload[5])
      } else {
        primary_length(opcode)
      };
      let Some(length) = length else {
        warn!("unknown LMP opcode 0x{opcode:02X}; skipping entry {sequence}");
        last = sequence;
        continue;
      };
      let length = length.min(CAPTURED_PAYLOAD);
      let packet = Bytes::copy_from_slice(&entry.payload[4..4 + length]);

      if sequence > last + 1 {
        warn!("dropped {} packets", sequence - last - 1);
      }

      let peer = *peers
        .entry(connection_number)
        .or_insert_with(|| self.resolve_peer(connection_number));
      let (source, destination) = if sent_by_device {
        (*device_address, peer)
      } else {
        (peer, *device_address)
      };
      let event = LmpEvent {
        packet,
        sent_by_device,
        source,
        destination,
        connection_number,
        sequence,
      };
      (self.callback)(&event);
      last = sequence;
    }
    last
  }

  /// Peer address for a connection number, in display order. Failures resolve to zeros; the
  /// packet itself is still delivered.
  fn resolve_peer(&self, connection_number: u8) -> [u8; 6] {
    let fw = self.session.firmware();
    if connection_number < 1 || connection_number > fw.connection_array_size {
      warn!("connection number {connection_number} out of bounds");
      return [0u8; 6];
    }
    let addr = fw.connection_array_address
      + (connection_number as u32 - 1) * fw.connection_struct_length
      + connection::ADDRESS_OFFSET as u32;
    match self.session.read_mem(addr, connection::ADDRESS_LEN as u32) {
      Ok(raw) if raw.len() == connection::ADDRESS_LEN => {
        let mut peer = [0u8; 6];
        for (idx, byte) in raw.iter().rev().enumerate() {
          peer[idx] = *byte;
        }
        peer
      }
      other => {
        warn!("could not resolve peer for connection {connection_number} ({other:?})");
        [0u8; 6]
      }
    }
  }
}

/// One parsed ring entry.
#[derive(Debug, Clone)]
pub(crate) struct RingEntry {
  pub tag: u32,
  pub payload: [u8; 28],
}

/// Split raw ring bytes into entries; incomplete trailing bytes are discarded.
pub(crate) fn parse_ring_entries(raw: &[u8]) -> Vec<RingEntry> {
  raw
    .chunks_exact(RING_ENTRY_LEN as usize)
    .filter_map(|chunk| {
      let tag = unpack_u32_le(chunk)?;
      let mut payload = [0u8; 28];
      payload.copy_from_slice(&chunk[4..]);
      Some(RingEntry { tag, payload })
    })
    .collect()
}

/// Plan which entry ranges to read for counter movement `last -> current`, as
/// `(first entry index, entry count)` spans in delivery order.
pub(crate) fn ring_read_spans(last: u32, current: u32) -> Vec<(u32, u32)> {
  let current_pos = current & (RING_ENTRIES - 1);
  let last_pos = last & (RING_ENTRIES - 1);
  let spans: Vec<(u32, u32)> = if current.wrapping_sub(last) >= RING_ENTRIES {
    // the writer lapped the reader; everything is new
    vec![(0, RING_ENTRIES)]
  } else if last_pos < current_pos {
    vec![(last_pos + 1, current_pos - last_pos)]
  } else {
    vec![
      (last_pos + 1, RING_ENTRIES - 1 - last_pos),
      (0, current_pos + 1),
    ]
  };
  spans.into_iter().filter(|&(_, count)| count > 0).collect()
}

/// Thumb source of the two capture hooks plus their 2-instruction dispatch prelude.
///
/// The receive hook is entered through a patchram diversion of the LMP receive path and jumps
/// back to the diverted instruction when done; the send hook is entered through the firmware's
/// LMP transmit function pointer.
fn hook_source(fw: &FirmwareConstants) -> String {
  format!(
    r#"
    b hook_send_lmp
    b hook_recv_lmp

hook_recv_lmp:
    push {{r2-r8, lr}}
    push {{r0-r3, lr}}

    @ bump the capture counter
    ldr  r0, =0x{ring:X}
    ldr  r1, [r0]
    add  r1, 1
    str  r1, [r0]

    @ tag the entry at (counter & 0x1F)
    and  r2, r1, 0x1F
    lsl  r2, r2, 5
    add  r0, 4
    add  r0, r2
    str  r1, [r0]

    @ stash the receive metadata word, then 24 packet bytes
    add  r0, 4
    ldr  r1, =0x{rxtable:X}
    ldr  r2, [r1]
    str  r2, [r0]
    add  r0, 4
    add  r1, 4
    ldr  r1, [r1]
    add  r1, 0xC
    mov  r2, 24
    bl   0x{memcpy:X}

    pop  {{r0-r3, lr}}
    b    0x{resume:X}

hook_send_lmp:
    push {{r4, r5, lr}}
    mov  r5, r0
    mov  r4, r1

    @ bump the capture counter
    ldr  r0, =0x{ring:X}
    ldr  r1, [r0]
    add  r1, 1
    str  r1, [r0]

    @ tag the entry, direction bit set
    and  r2, r1, 0x1F
    lsl  r2, r2, 5
    mov  r3, 1
    orr.w r1, r1, r3, LSL#31
    add  r0, 4
    add  r0, r2
    str  r1, [r0]

    @ connection number, then 24 packet bytes
    add  r0, 6
    ldr  r2, [r5]
    strb r2, [r0]
    add  r0, 2
    add  r1, r4, 0xC
    mov  r2, 24
    bl   0x{memcpy:X}

    mov  r0, 0
    pop  {{r4, r5, pc}}
"#,
    ring = fw.monitor_ring_base,
    rxtable = fw.lmp_receive_buffer_table,
    memcpy = fw.memcpy_address + 1,
    resume = fw.lmp_dispatch_return_address,
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use firmware::BCM4339;

  fn entry_bytes(tag: u32, payload_seed: u8) -> Vec<u8> {
    let mut raw = tag.to_le_bytes().to_vec();
    raw.extend(std::iter::repeat(payload_seed).take(28));
    raw
  }

  #[test]
  fn test_ring_read_spans_no_wrap() {
    assert_eq!(ring_read_spans(2, 5), vec![(3, 3)]);
    assert_eq!(ring_read_spans(0, 30), vec![(1, 30)]);
  }

  #[test]
  fn test_ring_read_spans_wrap() {
    // positions 30 -> 2: tail entry 31, then head entries 0..=2
    assert_eq!(ring_read_spans(30, 34), vec![(31, 1), (0, 3)]);
    // position 31 -> 0: tail span is empty and dropped
    assert_eq!(ring_read_spans(31, 32), vec![(0, 1)]);
  }

  #[test]
  fn test_ring_read_spans_lapped() {
    assert_eq!(ring_read_spans(2, 34), vec![(0, 32)]);
    assert_eq!(ring_read_spans(0, 100), vec![(0, 32)]);
  }

  #[test]
  fn test_ring_read_spans_counts_cover_delta() {
    for last in 0..70u32 {
      for delta in 1..32u32 {
        let current = last + delta;
        let total: u32 = ring_read_spans(last, current).iter().map(|&(_, n)| n).sum();
        assert_eq!(total, delta, "last={last} current={current}");
      }
    }
  }

  #[test]
  fn test_parse_ring_entries_ordering() {
    let mut raw = Vec::new();
    raw.extend(entry_bytes(0x8000_0003, 3)); // sent, sequence 3
    raw.extend(entry_bytes(0x0000_0001, 1));
    raw.extend(entry_bytes(0x0000_0002, 2));
    let mut entries = parse_ring_entries(&raw);
    entries.sort_by_key(|entry| entry.tag & SEQ_MASK);
    let sequences: Vec<u32> = entries.iter().map(|e| e.tag & SEQ_MASK).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(entries[2].tag & SENT_FLAG, SENT_FLAG);
  }

  #[test]
  fn test_parse_ring_entries_discards_partial_tail() {
    let mut raw = entry_bytes(7, 0);
    raw.extend_from_slice(&[0xAA; 10]);
    assert_eq!(parse_ring_entries(&raw).len(), 1);
  }

  #[test]
  fn test_hook_source_mentions_firmware_addresses() {
    let source = hook_source(&BCM4339);
    assert!(source.contains(&format!("0x{:X}", BCM4339.monitor_ring_base)));
    assert!(source.contains(&format!("0x{:X}", BCM4339.lmp_dispatch_return_address)));
    assert!(source.contains(&format!("0x{:X}", BCM4339.memcpy_address + 1)));
  }
}
