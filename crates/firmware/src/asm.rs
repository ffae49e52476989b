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

//! External thumb assembler binding.
//!
//! Injected code is produced from assembly source at runtime. The default implementation drives
//! GNU binutils (`as`, `ld`, `objcopy`) for ARM; discovery prefers the `arm-none-eabi` triplet
//! and can optionally fall back to scanning `$PATH` for any `arm-*` toolchain.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

/// Produces thumb machine code from assembly source, position-dependent at `vma`.
pub trait Assembler: Send + Sync {
  fn assemble(&self, source: &str, vma: u32) -> Result<Vec<u8>>;
}

/// Assembler backed by GNU binutils for ARM.
#[derive(Debug, Clone)]
pub struct GnuAssembler {
  as_tool: PathBuf,
  ld_tool: PathBuf,
  objcopy_tool: PathBuf,
}

/// Preferred toolchain triplet.
const PREFERRED_TRIPLET: &str = "arm-none-eabi";

/// Distinguishes scratch directories between concurrent assemblies.
static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

impl GnuAssembler {
  /// Locate an ARM binutils installation on `$PATH`.
  ///
  /// When the preferred `arm-none-eabi` triplet is absent and `fix_toolchain` is set, any
  /// `arm-*` triplet providing `as`, `ld` and `objcopy` is accepted instead (lowest sorting
  /// triplet wins, for determinism).
  pub fn discover(fix_toolchain: bool) -> Result<GnuAssembler> {
    if let Some(set) = Self::from_triplet(PREFERRED_TRIPLET) {
      return Ok(set);
    }
    debug!("{PREFERRED_TRIPLET} binutils not found in PATH");
    if !fix_toolchain {
      bail!("no {PREFERRED_TRIPLET} binutils in PATH");
    }

    let mut triplets = Vec::new();
    for dir in env::split_paths(&env::var_os("PATH").unwrap_or_default()) {
      let Ok(entries) = fs::read_dir(&dir) else { continue };
      for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(triplet) = name.strip_suffix("-as") {
          if triplet.starts_with("arm-") && !triplets.contains(&triplet.to_owned()) {
            triplets.push(triplet.to_owned());
          }
        }
      }
    }
    triplets.sort();

    for triplet in &triplets {
      if let Some(set) = Self::from_triplet(triplet) {
        warn!("using substitute arm toolchain `{triplet}`");
        return Ok(set);
      }
    }
    bail!("no usable arm binutils (as/ld/objcopy) found in PATH");
  }

  /// Build a toolchain from explicit tool paths.
  pub fn from_tools(as_tool: PathBuf, ld_tool: PathBuf, objcopy_tool: PathBuf) -> GnuAssembler {
    GnuAssembler {
      as_tool,
      ld_tool,
      objcopy_tool,
    }
  }

  fn from_triplet(triplet: &str) -> Option<GnuAssembler> {
    Some(GnuAssembler {
      as_tool: find_in_path(&format!("{triplet}-as"))?,
      ld_tool: find_in_path(&format!("{triplet}-ld"))?,
      objcopy_tool: find_in_path(&format!("{triplet}-objcopy"))?,
    })
  }
}

impl Assembler for GnuAssembler {
  fn assemble(&self, source: &str, vma: u32) -> Result<Vec<u8>> {
    let scratch = env::temp_dir().join(format!(
      "bluetap-asm-{}-{}",
      std::process::id(),
      SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed),
    ));
    fs::create_dir_all(&scratch).context("creating assembler scratch directory")?;
    let result = self.assemble_in(&scratch, source, vma);
    let _ = fs::remove_dir_all(&scratch);
    result
  }
}

impl GnuAssembler {
  fn assemble_in(&self, scratch: &Path, source: &str, vma: u32) -> Result<Vec<u8>> {
    let src = scratch.join("inject.s");
    let obj = scratch.join("inject.o");
    let elf = scratch.join("inject.elf");
    let bin = scratch.join("inject.bin");

    let mut unit = String::from(".syntax unified\n.thumb\n.text\n");
    unit.push_str(source);
    unit.push('\n');
    fs::write(&src, unit).context("writing assembly source")?;

    run_tool(
      &self.as_tool,
      &[
        OsStr::new("-march=armv7-a"),
        OsStr::new("-o"),
        obj.as_os_str(),
        src.as_os_str(),
      ],
    )?;
    run_tool(
      &self.ld_tool,
      &[
        OsStr::new("-Ttext"),
        OsStr::new(&format!("0x{vma:X}")),
        OsStr::new("-o"),
        elf.as_os_str(),
        obj.as_os_str(),
      ],
    )?;
    run_tool(
      &self.objcopy_tool,
      &[
        OsStr::new("-O"),
        OsStr::new("binary"),
        elf.as_os_str(),
        bin.as_os_str(),
      ],
    )?;

    let code = fs::read(&bin).context("reading assembled machine code")?;
    if code.is_empty() {
      bail!("assembler produced no machine code");
    }
    debug!("assembled {} bytes at vma 0x{vma:X}", code.len());
    Ok(code)
  }
}

fn run_tool(tool: &Path, args: &[&OsStr]) -> Result<()> {
  let output = Command::new(tool)
    .args(args)
    .output()
    .with_context(|| format!("spawning {}", tool.display()))?;
  if !output.status.success() {
    bail!(
      "{} failed ({}): {}",
      tool.display(),
      output.status,
      String::from_utf8_lossy(&output.stderr).trim(),
    );
  }
  Ok(())
}

fn find_in_path(name: &str) -> Option<PathBuf> {
  for dir in env::split_paths(&env::var_os("PATH")?) {
    let candidate = dir.join(name);
    if candidate.is_file() {
      return Some(candidate);
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_find_in_path_misses_unknown_tool() {
    assert_eq!(find_in_path("definitely-not-a-real-assembler-xyzzy"), None);
  }

  #[test]
  fn test_discover_without_fix_requires_preferred_triplet() {
    // The preferred triplet is unlikely to exist in CI; when it does not, strict discovery
    // must fail rather than substitute.
    if find_in_path(&format!("{PREFERRED_TRIPLET}-as")).is_none() {
      assert!(GnuAssembler::discover(false).is_err());
    }
  }

  #[test]
  fn test_from_tools_keeps_paths() {
    let set = GnuAssembler::from_tools(
      PathBuf::from("/opt/x/as"),
      PathBuf::from("/opt/x/ld"),
      PathBuf::from("/opt/x/objcopy"),
    );
    assert_eq!(set.as_tool, PathBuf::from("/opt/x/as"));
  }
}
