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

//! Receive and send workers.
//!
//! The receive worker drains the snoop socket, parses records and distributes them to the
//! primary inbound queue, the send worker's private queue, and the stack-dump detector. The
//! send worker serializes outbound commands and correlates each with its Command Complete
//! event. The two communicate only through the shared queues and atomic flags.

use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use hci::snoop::RecordHeader;
use hci::{HciPacket, StackDumpDetector, RECORD_HEADER_LEN};

use crate::queue::ResponseSlot;
use crate::session::Shared;
use crate::transport::{CaptureLog, InjectStream, ReadOutcome, SnoopStream, SOCKET_TIMEOUT};

/// One record lifted off the snoop stream.
#[derive(Debug, Clone)]
pub struct Record {
  /// Decoded HCI frame.
  pub packet: HciPacket,

  /// Raw record header fields.
  pub header: RecordHeader,

  /// Arrival time, when the record timestamp is representable.
  pub timestamp: Option<SystemTime>,
}

/// An outbound command waiting for its response.
pub(crate) struct PendingCommand {
  pub opcode: u16,
  pub params: Bytes,
  pub slot: Arc<ResponseSlot>,
}

/// Receive worker body. Runs until cancellation, EOF, or a read failure.
pub(crate) fn run_recv_worker(
  mut snoop: SnoopStream,
  mut capture: Option<CaptureLog>,
  shared: Arc<Shared>,
) {
  debug!("receive worker started (log level {})", shared.config.log_level);
  let mut detector = StackDumpDetector::new();

  while !shared.exit_requested.load(Ordering::SeqCst) {
    let mut header_raw = [0u8; RECORD_HEADER_LEN];
    match snoop.fill(&mut header_raw, &shared.exit_requested) {
      Ok(ReadOutcome::Filled) => {}
      Ok(ReadOutcome::Eof) => {
        info!("snoop socket closed by remote side; stopping");
        shared.exit_requested.store(true, Ordering::SeqCst);
        break;
      }
      Ok(ReadOutcome::Cancelled) => break,
      Err(err) => {
        warn!("snoop header read failed: {err}");
        shared.exit_requested.store(true, Ordering::SeqCst);
        break;
      }
    }
    if let Some(capture) = capture.as_mut() {
      capture.append(&header_raw);
    }
    // 24 bytes are in hand, parsing cannot fail
    let Ok(header) = RecordHeader::parse(&header_raw) else { break };

    let mut body = vec![0u8; header.included_len as usize];
    match snoop.fill(&mut body, &shared.exit_requested) {
      Ok(ReadOutcome::Filled) => {}
      Ok(ReadOutcome::Eof) => {
        info!("snoop socket closed mid-record; stopping");
        shared.exit_requested.store(true, Ordering::SeqCst);
        break;
      }
      Ok(ReadOutcome::Cancelled) => break,
      Err(err) => {
        warn!("snoop record read failed: {err}");
        shared.exit_requested.store(true, Ordering::SeqCst);
        break;
      }
    }
    if let Some(capture) = capture.as_mut() {
      capture.append(&body);
    }

    let packet = match HciPacket::parse(&body) {
      Ok(packet) => packet,
      Err(err) => {
        warn!("undecodable snoop record ({err}); skipping");
        continue;
      }
    };
    let crashed = detector.process(&packet);
    let record = Record {
      packet,
      header,
      timestamp: header.timestamp(),
    };
    trace!("<- {}", record.packet);

    if shared.recv_queue.is_full() {
      debug!(
        "inbound queue full; flushed {} stale records",
        shared.recv_queue.flush()
      );
    }
    if shared.recv_queue.try_push(record.clone()).is_err() {
      warn!("inbound queue full; dropping record");
    }
    if shared.send_alive.load(Ordering::SeqCst)
      && shared.send_scoped_queue.try_push(record).is_err()
    {
      warn!("send worker queue full; dropping record");
    }

    if crashed {
      warn!("controller sent a stack dump; stopping session");
      shared.crashed.store(true, Ordering::SeqCst);
      shared.exit_requested.store(true, Ordering::SeqCst);
      break;
    }
  }
  debug!("receive worker terminated");
}

/// Send worker body.
///
/// The private queue is flushed before each transmit, so only events arriving after the command
/// hit the wire can be taken for its response; commands sharing an opcode cannot be confused.
pub(crate) fn run_send_worker(mut inject: InjectStream, shared: Arc<Shared>) {
  debug!("send worker started (log level {})", shared.config.log_level);
  shared.send_alive.store(true, Ordering::SeqCst);

  while !shared.exit_requested.load(Ordering::SeqCst) {
    let stale = shared.send_scoped_queue.flush();
    if stale > 0 {
      trace!("discarded {stale} events seen before dispatch");
    }

    let Some(request) = shared.send_queue.pop_timeout(SOCKET_TIMEOUT) else {
      continue;
    };
    trace!("-> CMD 0x{:04X} ({} parameter bytes)", request.opcode, request.params.len());
    if let Err(err) = inject.send_command(request.opcode, &request.params) {
      warn!("inject write failed: {err}");
      shared.exit_requested.store(true, Ordering::SeqCst);
      break;
    }

    while !shared.exit_requested.load(Ordering::SeqCst) {
      let Some(record) = shared.send_scoped_queue.pop_timeout(SOCKET_TIMEOUT) else {
        // a submitter that timed out has dropped its end of the rendezvous; stop
        // waiting on its behalf so later commands are not held up
        if Arc::strong_count(&request.slot) == 1 {
          debug!("response wait for 0x{:04X} abandoned by submitter", request.opcode);
          break;
        }
        continue;
      };
      if record.packet.is_command_complete(request.opcode) {
        if let Some(data) = record.packet.event_data() {
          request.slot.deliver(data.clone());
        }
        break;
      }
    }
  }

  shared.send_alive.store(false, Ordering::SeqCst);
  debug!("send worker terminated");
}
