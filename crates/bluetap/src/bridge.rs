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

//! Mobile-device bridge control.
//!
//! The bridge (adb) forwards loopback TCP ports to the Bluetooth stack endpoints inside the
//! phone. It is only ever invoked from the session thread, never from workers.

use anyhow::{bail, Context, Result};
use log::debug;
use std::process::Command;

/// One attached device as reported by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDevice {
  pub serial: String,
  pub model: Option<String>,
}

/// Handle on the bridge binary.
#[derive(Debug, Clone)]
pub(crate) struct Bridge {
  binary: String,
}

impl Bridge {
  pub fn new(binary: impl Into<String>) -> Bridge {
    Bridge { binary: binary.into() }
  }

  /// Enumerate attached devices in the `device` state.
  pub fn devices(&self) -> Result<Vec<BridgeDevice>> {
    let raw = self.run(None, &["devices", "-l"])?;
    Ok(parse_device_list(&raw))
  }

  /// Forward a loopback TCP port to a device-side TCP port.
  pub fn forward(&self, serial: Option<&str>, host_port: u16, device_port: u16) -> Result<()> {
    self.run(
      serial,
      &["forward", &format!("tcp:{host_port}"), &format!("tcp:{device_port}")],
    )?;
    debug!("bridge forwarding tcp:{host_port} -> device tcp:{device_port}");
    Ok(())
  }

  /// Remove a previously installed forwarding.
  pub fn remove_forward(&self, serial: Option<&str>, host_port: u16) -> Result<()> {
    self.run(serial, &["forward", "--remove", &format!("tcp:{host_port}")])?;
    debug!("bridge forwarding tcp:{host_port} removed");
    Ok(())
  }

  fn run(&self, serial: Option<&str>, args: &[&str]) -> Result<String> {
    let mut command = Command::new(&self.binary);
    if let Some(serial) = serial {
      command.arg("-s").arg(serial);
    }
    command.args(args);
    let output = command
      .output()
      .with_context(|| format!("spawning bridge `{}`", self.binary))?;
    if !output.status.success() {
      bail!(
        "bridge `{} {}` failed ({}): {}",
        self.binary,
        args.join(" "),
        output.status,
        String::from_utf8_lossy(&output.stderr).trim(),
      );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
  }
}

/// Parse `devices -l` output into serial/model pairs, keeping only ready devices.
fn parse_device_list(raw: &str) -> Vec<BridgeDevice> {
  let mut devices = Vec::new();
  for line in raw.lines().skip(1) {
    let mut fields = line.split_whitespace();
    let Some(serial) = fields.next() else { continue };
    let Some(state) = fields.next() else { continue };
    if state != "device" {
      continue;
    }
    let model = fields
      .find_map(|field| field.strip_prefix("model:"))
      .map(str::to_owned);
    devices.push(BridgeDevice {
      serial: serial.to_owned(),
      model,
    });
  }
  devices
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_device_list() {
    let raw = "List of devices attached\n\
               0123456789ABCDEF       device usb:1-2 product:hammerhead model:Nexus_5 device:hammerhead\n\
               FEDCBA9876543210       unauthorized usb:1-3\n\
               \n";
    let devices = parse_device_list(raw);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].serial, "0123456789ABCDEF");
    assert_eq!(devices[0].model.as_deref(), Some("Nexus_5"));
  }

  #[test]
  fn test_parse_device_list_empty() {
    assert!(parse_device_list("List of devices attached\n\n").is_empty());
  }

  #[test]
  fn test_parse_device_list_without_model() {
    let raw = "List of devices attached\nemulator-5554 device\n";
    let devices = parse_device_list(raw);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].model, None);
  }
}
