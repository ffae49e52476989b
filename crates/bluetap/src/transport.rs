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

//! Socket transport.
//!
//! Two loopback TCP streams reach the controller through bridge forwardings: the snoop stream
//! (read-only; carries the btsnoop header and every inbound record) and the inject stream
//! (write-dominant; carries framed HCI commands). Both use a short receive timeout so workers
//! can re-check cancellation between reads.

use log::warn;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hci::codec::build_command_frame;

/// Receive timeout on both sockets; bounds worker cancellation latency.
pub(crate) const SOCKET_TIMEOUT: Duration = Duration::from_millis(500);

/// Device-side TCP port of the snoop stream.
pub(crate) const DEVICE_SNOOP_PORT: u16 = 8872;

/// Device-side TCP port of the injection endpoint.
pub(crate) const DEVICE_INJECT_PORT: u16 = 8873;

/// How long session setup waits for the 16-byte snoop file header.
const HEADER_DEADLINE: Duration = Duration::from_secs(2);

/// Result of an exit-aware framed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
  /// The buffer was filled completely.
  Filled,

  /// The remote side closed the stream.
  Eof,

  /// The exit flag was raised while waiting.
  Cancelled,
}

/// Read-only snoop stream.
pub(crate) struct SnoopStream {
  stream: TcpStream,
}

impl SnoopStream {
  pub fn connect(port: u16) -> io::Result<SnoopStream> {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    Ok(SnoopStream { stream })
  }

  /// Consume exactly the 16-byte btsnoop file header; `None` when the peer supplies fewer bytes
  /// within the setup deadline.
  pub fn read_file_header(&mut self) -> io::Result<Option<[u8; 16]>> {
    let mut header = [0u8; 16];
    let mut filled = 0;
    let deadline = Instant::now() + HEADER_DEADLINE;
    while filled < header.len() {
      match self.stream.read(&mut header[filled..]) {
        Ok(0) => return Ok(None),
        Ok(n) => filled += n,
        Err(err) if is_timeout(&err) => {
          if Instant::now() >= deadline {
            return Ok(None);
          }
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => return Err(err),
      }
    }
    Ok(Some(header))
  }

  /// Fill `buf` from the stream, re-checking `exit` on every receive timeout.
  pub fn fill(&mut self, buf: &mut [u8], exit: &AtomicBool) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
      if exit.load(Ordering::SeqCst) {
        return Ok(ReadOutcome::Cancelled);
      }
      match self.stream.read(&mut buf[filled..]) {
        Ok(0) => return Ok(ReadOutcome::Eof),
        Ok(n) => filled += n,
        Err(err) if is_timeout(&err) => {}
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => return Err(err),
      }
    }
    Ok(ReadOutcome::Filled)
  }
}

/// Write side of the HCI connection.
pub(crate) struct InjectStream {
  stream: TcpStream,
}

impl InjectStream {
  pub fn connect(port: u16) -> io::Result<InjectStream> {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    Ok(InjectStream { stream })
  }

  /// Frame and transmit one HCI command.
  pub fn send_command(&mut self, opcode: u16, params: &[u8]) -> io::Result<()> {
    let frame = build_command_frame(opcode, params);
    self.stream.write_all(&frame)
  }
}

fn is_timeout(err: &io::Error) -> bool {
  matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Byte-exact mirror of the snoop stream.
///
/// Receives the file header and every record header and body in arrival order, making the file
/// a drop-in btsnoop v1 capture. Written only from the receive worker.
pub(crate) struct CaptureLog {
  writer: BufWriter<File>,
}

impl CaptureLog {
  pub fn create(path: &Path) -> io::Result<CaptureLog> {
    Ok(CaptureLog {
      writer: BufWriter::new(File::create(path)?),
    })
  }

  /// Append wire bytes; failures degrade to a warning so capture trouble never stalls ingest.
  pub fn append(&mut self, bytes: &[u8]) {
    if let Err(err) = self.writer.write_all(bytes) {
      warn!("capture log write failed: {err}");
    }
  }
}

impl Drop for CaptureLog {
  fn drop(&mut self) {
    if let Err(err) = self.writer.flush() {
      warn!("capture log flush failed: {err}");
    }
  }
}
