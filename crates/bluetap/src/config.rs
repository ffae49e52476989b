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

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Session configuration. Workers receive a snapshot of this value at spawn time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  /// Capacity of each bounded packet queue.
  pub queue_size: usize,

  /// Where to mirror the raw snoop stream; `None` disables capture logging.
  pub capture_log_path: Option<PathBuf>,

  /// Informational log level label carried into worker snapshots.
  pub log_level: String,

  /// Accept any `arm-*` binutils triplet when `arm-none-eabi` is missing.
  pub assembler_fix: bool,

  /// Pin the bridge to one device; required when several devices are attached.
  pub device_serial: Option<String>,

  /// Bridge binary to invoke.
  pub adb_path: String,
}

impl Default for Config {
  fn default() -> Config {
    Config {
      queue_size: 1000,
      capture_log_path: None,
      log_level: "info".to_owned(),
      assembler_fix: true,
      device_serial: None,
      adb_path: "adb".to_owned(),
    }
  }
}

impl Config {
  /// Parse a configuration from TOML text.
  pub fn from_toml(raw: &str) -> Result<Config> {
    toml::from_str(raw).context("parsing configuration")
  }

  /// Load a configuration from a TOML file.
  pub fn from_file(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
      .with_context(|| format!("reading configuration at {}", path.display()))?;
    Config::from_toml(&raw)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.queue_size, 1000);
    assert_eq!(config.capture_log_path, None);
    assert_eq!(config.log_level, "info");
    assert!(config.assembler_fix);
    assert_eq!(config.adb_path, "adb");
  }

  #[test]
  fn test_from_toml_partial() {
    let config = Config::from_toml(
      r#"
        queue_size = 64
        capture_log_path = "/tmp/capture.btsnoop"
        device_serial = "0123456789ABCDEF"
      "#,
    )
    .unwrap();
    assert_eq!(config.queue_size, 64);
    assert_eq!(
      config.capture_log_path.as_deref(),
      Some(Path::new("/tmp/capture.btsnoop"))
    );
    assert_eq!(config.device_serial.as_deref(), Some("0123456789ABCDEF"));
    // untouched fields keep defaults
    assert_eq!(config.log_level, "info");
  }

  #[test]
  fn test_from_toml_rejects_unknown_keys() {
    assert!(Config::from_toml("queue_capacity = 10").is_err());
  }
}
