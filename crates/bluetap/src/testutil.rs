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

//! Test support: an in-process fake controller.
//!
//! Serves the snoop and inject endpoints on loopback, answers the vendor memory commands out of
//! a sparse byte map, and lets tests inject arbitrary frames into the snoop stream.

use anyhow::Result as AnyResult;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use firmware::Assembler;

/// Assembler stub returning fixed machine code; hook assembly in tests never shells out.
pub(crate) struct StaticAssembler {
  code: Vec<u8>,
}

impl StaticAssembler {
  pub fn new(code: Vec<u8>) -> StaticAssembler {
    StaticAssembler { code }
  }
}

impl Assembler for StaticAssembler {
  fn assemble(&self, _source: &str, _vma: u32) -> AnyResult<Vec<u8>> {
    Ok(self.code.clone())
  }
}

/// Knobs for [`FakeController::start_with`].
pub(crate) struct FakeOptions {
  /// Bytes served as the btsnoop file header.
  pub header: Vec<u8>,

  /// Close the snoop stream right after the header.
  pub close_after_header: bool,
}

impl Default for FakeOptions {
  fn default() -> FakeOptions {
    let mut header = Vec::with_capacity(16);
    header.extend_from_slice(b"btsnoop\0");
    header.extend_from_slice(&1u32.to_be_bytes());
    header.extend_from_slice(&1002u32.to_be_bytes());
    FakeOptions {
      header,
      close_after_header: false,
    }
  }
}

struct FakeState {
  memory: Mutex<HashMap<u32, u8>>,
  launched: Mutex<Vec<u32>>,
  requests: Mutex<Vec<(u16, Vec<u8>)>>,
  silent: Mutex<HashSet<u16>>,
  force_status: Mutex<HashMap<u16, u8>>,
  pre_response_noise: Mutex<Option<Vec<u8>>>,
  sent_log: Mutex<Vec<u8>>,
  outbound: Mutex<Sender<Vec<u8>>>,
  stop: AtomicBool,
}

/// In-process stand-in for the controller behind the bridge.
pub(crate) struct FakeController {
  pub snoop_port: u16,
  pub inject_port: u16,
  state: Arc<FakeState>,
  threads: Vec<JoinHandle<()>>,
}

impl FakeController {
  pub fn start() -> FakeController {
    FakeController::start_with(FakeOptions::default())
  }

  pub fn start_with(options: FakeOptions) -> FakeController {
    let snoop_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let inject_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let snoop_port = snoop_listener.local_addr().unwrap().port();
    let inject_port = inject_listener.local_addr().unwrap().port();

    let (outbound, inbox) = channel::<Vec<u8>>();
    let state = Arc::new(FakeState {
      memory: Mutex::new(HashMap::new()),
      launched: Mutex::new(Vec::new()),
      requests: Mutex::new(Vec::new()),
      silent: Mutex::new(HashSet::new()),
      force_status: Mutex::new(HashMap::new()),
      pre_response_noise: Mutex::new(None),
      sent_log: Mutex::new(Vec::new()),
      outbound: Mutex::new(outbound),
      stop: AtomicBool::new(false),
    });

    let snoop_state = Arc::clone(&state);
    let header = options.header;
    let close_after_header = options.close_after_header;
    let snoop_thread = thread::spawn(move || {
      serve_snoop(snoop_listener, snoop_state, inbox, header, close_after_header);
    });
    let inject_state = Arc::clone(&state);
    let inject_thread = thread::spawn(move || serve_inject(inject_listener, inject_state));

    FakeController {
      snoop_port,
      inject_port,
      state,
      threads: vec![snoop_thread, inject_thread],
    }
  }

  /// Push an arbitrary H4 frame into the snoop stream, wrapped as a record.
  pub fn inject_frame(&self, frame: &[u8]) {
    let record = make_record(frame);
    let _ = self.state.outbound.lock().unwrap().send(record);
  }

  /// Stop answering the given opcode, so commands against it time out.
  pub fn silence_opcode(&self, opcode: u16) {
    self.state.silent.lock().unwrap().insert(opcode);
  }

  /// Answer the given opcode with a fixed nonzero status.
  pub fn force_status(&self, opcode: u16, status: u8) {
    self.state.force_status.lock().unwrap().insert(opcode, status);
  }

  /// Send this frame immediately before every command response.
  pub fn set_pre_response_noise(&self, frame: Vec<u8>) {
    *self.state.pre_response_noise.lock().unwrap() = Some(frame);
  }

  pub fn write_memory(&self, addr: u32, bytes: &[u8]) {
    let mut memory = self.state.memory.lock().unwrap();
    for (offset, byte) in bytes.iter().enumerate() {
      memory.insert(addr + offset as u32, *byte);
    }
  }

  pub fn write_u32(&self, addr: u32, value: u32) {
    self.write_memory(addr, &value.to_le_bytes());
  }

  pub fn read_memory(&self, addr: u32, len: u32) -> Vec<u8> {
    let memory = self.state.memory.lock().unwrap();
    (0..len).map(|offset| *memory.get(&(addr + offset)).unwrap_or(&0)).collect()
  }

  pub fn read_u32(&self, addr: u32) -> u32 {
    u32::from_le_bytes(self.read_memory(addr, 4).try_into().unwrap())
  }

  pub fn launched(&self) -> Vec<u32> {
    self.state.launched.lock().unwrap().clone()
  }

  pub fn requests_for(&self, opcode: u16) -> Vec<Vec<u8>> {
    self
      .state
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|(op, _)| *op == opcode)
      .map(|(_, params)| params.clone())
      .collect()
  }

  /// Every byte written to the snoop stream so far, header included.
  pub fn sent_bytes(&self) -> Vec<u8> {
    self.state.sent_log.lock().unwrap().clone()
  }
}

impl Drop for FakeController {
  fn drop(&mut self) {
    self.state.stop.store(true, Ordering::SeqCst);
    for thread in self.threads.drain(..) {
      let _ = thread.join();
    }
  }
}

/// Spin until `predicate` holds, panicking after `timeout`.
pub(crate) fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
  let deadline = Instant::now() + timeout;
  while !predicate() {
    if Instant::now() >= deadline {
      panic!("condition not reached within {timeout:?}");
    }
    thread::sleep(Duration::from_millis(10));
  }
}

/// Wrap an H4 frame into a snoop record (24-byte header + frame).
fn make_record(frame: &[u8]) -> Vec<u8> {
  let mut record = Vec::with_capacity(24 + frame.len());
  record.extend_from_slice(&(frame.len() as u32).to_be_bytes());
  record.extend_from_slice(&(frame.len() as u32).to_be_bytes());
  record.extend_from_slice(&1u32.to_be_bytes());
  record.extend_from_slice(&0u32.to_be_bytes());
  record.extend_from_slice(&0x00E0_3AB4_4A67_6000i64.to_be_bytes());
  record.extend_from_slice(frame);
  record
}

fn serve_snoop(
  listener: TcpListener,
  state: Arc<FakeState>,
  inbox: Receiver<Vec<u8>>,
  header: Vec<u8>,
  close_after_header: bool,
) {
  let Ok((mut stream, _)) = listener.accept() else { return };
  state.sent_log.lock().unwrap().extend_from_slice(&header);
  if stream.write_all(&header).is_err() {
    return;
  }
  if close_after_header {
    return;
  }
  while !state.stop.load(Ordering::SeqCst) {
    match inbox.recv_timeout(Duration::from_millis(50)) {
      Ok(record) => {
        state.sent_log.lock().unwrap().extend_from_slice(&record);
        if stream.write_all(&record).is_err() {
          return;
        }
      }
      Err(_) => continue,
    }
  }
}

fn serve_inject(listener: TcpListener, state: Arc<FakeState>) {
  let Ok((mut stream, _)) = listener.accept() else { return };
  stream.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
  while !state.stop.load(Ordering::SeqCst) {
    let mut prefix = [0u8; 3];
    if !read_full(&mut stream, &mut prefix, &state.stop) {
      return;
    }
    let payload_len = u16::from_le_bytes([prefix[1], prefix[2]]) as usize;
    let mut payload = vec![0u8; payload_len];
    if !read_full(&mut stream, &mut payload, &state.stop) {
      return;
    }
    if prefix[0] != 0x01 || payload.len() < 3 {
      continue;
    }
    let opcode = u16::from_le_bytes([payload[0], payload[1]]);
    let params = payload[3..].to_vec();
    state.requests.lock().unwrap().push((opcode, params.clone()));

    if state.silent.lock().unwrap().contains(&opcode) {
      continue;
    }
    if let Some(noise) = state.pre_response_noise.lock().unwrap().clone() {
      let _ = state.outbound.lock().unwrap().send(make_record(&noise));
    }

    let status = *state.force_status.lock().unwrap().get(&opcode).unwrap_or(&0);
    let mut data = vec![0x01, payload[0], payload[1], status];
    match opcode {
      0xFC4D if params.len() >= 5 => {
        let addr = u32::from_le_bytes(params[..4].try_into().unwrap());
        let blocksize = params[4] as u32;
        let memory = state.memory.lock().unwrap();
        data.extend((0..blocksize).map(|offset| *memory.get(&(addr + offset)).unwrap_or(&0)));
      }
      0xFC4C if params.len() >= 4 => {
        let addr = u32::from_le_bytes(params[..4].try_into().unwrap());
        let mut memory = state.memory.lock().unwrap();
        for (offset, byte) in params[4..].iter().enumerate() {
          memory.insert(addr + offset as u32, *byte);
        }
      }
      0xFC4E if params.len() >= 4 => {
        let addr = u32::from_le_bytes(params[..4].try_into().unwrap());
        state.launched.lock().unwrap().push(addr);
      }
      _ => {}
    }

    let mut frame = vec![0x04, 0x0E, data.len() as u8];
    frame.extend_from_slice(&data);
    let _ = state.outbound.lock().unwrap().send(make_record(&frame));
  }
}

/// Read exactly `buf` bytes, tolerating receive timeouts; `false` on EOF or stop.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], stop: &AtomicBool) -> bool {
  let mut filled = 0;
  while filled < buf.len() {
    if stop.load(Ordering::SeqCst) {
      return false;
    }
    match stream.read(&mut buf[filled..]) {
      Ok(0) => return false,
      Ok(n) => filled += n,
      Err(err)
        if matches!(
          err.kind(),
          std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ) => {}
      Err(_) => return false,
    }
  }
  true
}
