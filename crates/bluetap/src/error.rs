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

use core::fmt;
use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced to callers.
///
/// Workers never propagate errors across task boundaries; they signal through flags and these
/// values are produced at the API surface.
#[derive(Debug)]
pub enum Error {
  /// The snoop or inject socket died; the session is winding down.
  TransportLost(String),

  /// No Command Complete arrived within the caller's deadline. The session stays usable.
  CommandTimeout { opcode: u16 },

  /// The controller rejected a command with a nonzero status byte.
  CommandStatus { opcode: u16, status: u8 },

  /// A controller stack dump was observed; controller state is no longer trustworthy.
  ControllerCrash,

  /// API misuse: call before connect, bad connection number, malformed patch, and the like.
  /// Rejected up front, with no side effects.
  Misuse(String),

  /// The device bridge could not be set up; no sockets were opened.
  BridgeSetup(String),

  /// The external thumb assembler is unavailable or failed.
  Assembler(String),

  /// Underlying socket or file I/O failure.
  Io(io::Error),
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Error::TransportLost(reason) => write!(f, "transport lost: {reason}"),
      Error::CommandTimeout { opcode } => {
        write!(f, "timed out waiting for Command Complete of opcode 0x{opcode:04X}")
      }
      Error::CommandStatus { opcode, status } => {
        write!(f, "controller returned status 0x{status:02X} for opcode 0x{opcode:04X}")
      }
      Error::ControllerCrash => write!(f, "controller emitted a stack dump"),
      Error::Misuse(reason) => write!(f, "misuse: {reason}"),
      Error::BridgeSetup(reason) => write!(f, "bridge setup failed: {reason}"),
      Error::Assembler(reason) => write!(f, "assembler failure: {reason}"),
      Error::Io(err) => write!(f, "i/o failure: {err}"),
    }
  }
}

impl std::error::Error for Error {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Error::Io(err) => Some(err),
      _ => None,
    }
  }
}

impl From<io::Error> for Error {
  fn from(err: io::Error) -> Error {
    Error::Io(err)
  }
}
