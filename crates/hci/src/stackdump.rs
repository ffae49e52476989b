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

use log::error;

use crate::packet::{HciPacket, EVT_VENDOR};

/// First payload byte of a vendor debug event carrying a stack dump.
const SUB_EVENT_STACK_DUMP: u8 = 0x57;

/// Watches the event stream for controller stack dumps.
///
/// The controller emits a vendor-specific debug event after an internal crash; once one is seen
/// the controller state is no longer trustworthy and the session must wind down.
#[derive(Debug, Default)]
pub struct StackDumpDetector {
  observed: bool,
}

impl StackDumpDetector {
  pub fn new() -> StackDumpDetector {
    StackDumpDetector::default()
  }

  /// Feed one inbound frame; returns `true` once a stack dump has been observed.
  pub fn process(&mut self, packet: &HciPacket) -> bool {
    if let HciPacket::Event { event_code, data } = packet {
      if *event_code == EVT_VENDOR && data.first() == Some(&SUB_EVENT_STACK_DUMP) {
        if !self.observed {
          error!("controller stack dump received ({} bytes of state)", data.len());
        }
        self.observed = true;
      }
    }
    self.observed
  }

  /// Whether a stack dump has been observed so far.
  pub fn observed(&self) -> bool {
    self.observed
  }
}
