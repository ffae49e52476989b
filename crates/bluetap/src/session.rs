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

//! Session lifecycle.
//!
//! A [`Session`] owns the bridge forwardings, the two sockets (handed to their workers once
//! spawned), the queues, and the cancellation flags. It is an explicit value; clones share the
//! same underlying session. One session drives exactly one controller.

use bytes::Bytes;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use firmware::{Assembler, FirmwareConstants, GnuAssembler, BCM4339};
use hci::SnoopHeader;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::PatchramTable;
use crate::monitor::{MonitorState, MonitorWorker};
use crate::pipeline::{run_recv_worker, run_send_worker, PendingCommand, Record};
use crate::queue::{BoundedQueue, ResponseSlot};
use crate::transport::{
  CaptureLog, InjectStream, SnoopStream, DEVICE_INJECT_PORT, DEVICE_SNOOP_PORT,
};

/// State shared between the session and its workers.
pub(crate) struct Shared {
  /// Configuration snapshot workers receive at spawn.
  pub config: Config,

  /// Cooperative cancellation for the whole session.
  pub exit_requested: AtomicBool,

  /// Cooperative cancellation for the monitor only.
  pub monitor_exit_requested: AtomicBool,

  /// Set when the controller emitted a stack dump.
  pub crashed: AtomicBool,

  /// Whether the send worker is alive and consuming its private queue.
  pub send_alive: AtomicBool,

  /// Primary inbound record queue, in snoop-stream order.
  pub recv_queue: BoundedQueue<Record>,

  /// Inbound records mirrored for the send worker's response correlation.
  pub send_scoped_queue: BoundedQueue<Record>,

  /// Outbound command requests.
  pub send_queue: BoundedQueue<PendingCommand>,
}

/// Live transport workers plus the forwardings they ride on.
struct Link {
  recv_worker: JoinHandle<()>,
  send_worker: JoinHandle<()>,
  forwarded: Option<Forwarded>,
}

/// Bridge forwardings installed by [`Session::connect`], removed at shutdown.
#[derive(Clone)]
struct Forwarded {
  serial: Option<String>,
  snoop_port: u16,
  inject_port: u16,
}

pub(crate) struct MonitorHandle {
  pub worker: JoinHandle<()>,
  pub thread_id: ThreadId,
}

struct SessionInner {
  firmware: &'static FirmwareConstants,
  shared: Arc<Shared>,
  assembler: Option<Arc<dyn Assembler>>,
  bridge: Bridge,
  running: AtomicBool,
  link: Mutex<Option<Link>>,
  monitor: Mutex<Option<MonitorHandle>>,
  monitor_state: AtomicU8,
  patchram: Mutex<PatchramTable>,
}

/// Handle on one controller session. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Session {
  inner: Arc<SessionInner>,
}

impl Session {
  /// Build a session, discovering the external thumb assembler on `$PATH`.
  ///
  /// When no assembler is found the session still works for everything except LMP monitoring
  /// and injection.
  pub fn new(config: Config) -> Session {
    let assembler = match GnuAssembler::discover(config.assembler_fix) {
      Ok(assembler) => Some(Arc::new(assembler) as Arc<dyn Assembler>),
      Err(err) => {
        warn!("no arm assembler available ({err:#}); LMP monitoring and injection disabled");
        None
      }
    };
    Session::build(config, assembler)
  }

  /// Build a session around an explicit assembler binding.
  pub fn with_assembler(config: Config, assembler: Arc<dyn Assembler>) -> Session {
    Session::build(config, Some(assembler))
  }

  fn build(config: Config, assembler: Option<Arc<dyn Assembler>>) -> Session {
    let shared = Arc::new(Shared {
      exit_requested: AtomicBool::new(false),
      monitor_exit_requested: AtomicBool::new(false),
      crashed: AtomicBool::new(false),
      send_alive: AtomicBool::new(false),
      recv_queue: BoundedQueue::new(config.queue_size),
      send_scoped_queue: BoundedQueue::new(config.queue_size),
      send_queue: BoundedQueue::new(config.queue_size),
      config: config.clone(),
    });
    Session {
      inner: Arc::new(SessionInner {
        firmware: &BCM4339,
        bridge: Bridge::new(config.adb_path),
        patchram: Mutex::new(PatchramTable::new(&BCM4339.patchram)),
        shared,
        assembler,
        running: AtomicBool::new(false),
        link: Mutex::new(None),
        monitor: Mutex::new(None),
        monitor_state: AtomicU8::new(MonitorState::Inactive as u8),
      }),
    }
  }

  /// The firmware constant table this session targets.
  pub fn firmware(&self) -> &'static FirmwareConstants {
    self.inner.firmware
  }

  pub fn is_running(&self) -> bool {
    self.inner.running.load(Ordering::SeqCst)
  }

  /// Whether session-wide exit has been requested (cancellation, EOF, or crash).
  pub fn exit_requested(&self) -> bool {
    self.inner.shared.exit_requested.load(Ordering::SeqCst)
  }

  /// Current monitor lifecycle state.
  pub fn monitor_state(&self) -> MonitorState {
    MonitorState::from_u8(self.inner.monitor_state.load(Ordering::SeqCst))
  }

  /// Select a device, install bridge forwardings on a random port pair, and open the session.
  pub fn connect(&self) -> Result<()> {
    if self.exit_requested() {
      self.shutdown()?;
    }
    if self.is_running() {
      return Err(Error::Misuse("already connected; call shutdown() first".to_owned()));
    }

    let devices = self
      .inner
      .bridge
      .devices()
      .map_err(|err| Error::BridgeSetup(format!("{err:#}")))?;
    let serial = match (&self.inner.shared.config.device_serial, devices.as_slice()) {
      (_, []) => return Err(Error::BridgeSetup("no devices attached".to_owned())),
      (Some(serial), _) => {
        if !devices.iter().any(|device| &device.serial == serial) {
          return Err(Error::BridgeSetup(format!("device {serial} is not attached")));
        }
        Some(serial.clone())
      }
      (None, [only]) => {
        info!(
          "using device {} ({})",
          only.serial,
          only.model.as_deref().unwrap_or("unknown model")
        );
        Some(only.serial.clone())
      }
      (None, many) => {
        let serials: Vec<&str> = many.iter().map(|device| device.serial.as_str()).collect();
        return Err(Error::Misuse(format!(
          "several devices attached; set device_serial to one of: {}",
          serials.join(", ")
        )));
      }
    };

    let snoop_port: u16 = rand::thread_rng().gen_range(60000..=65534);
    let inject_port = snoop_port + 1;
    debug!("selected forwarding ports snoop={snoop_port} inject={inject_port}");
    let forwarded = Forwarded {
      serial,
      snoop_port,
      inject_port,
    };
    let serial = forwarded.serial.as_deref();
    self
      .inner
      .bridge
      .forward(serial, snoop_port, DEVICE_SNOOP_PORT)
      .map_err(|err| Error::BridgeSetup(format!("{err:#}")))?;
    if let Err(err) = self.inner.bridge.forward(serial, inject_port, DEVICE_INJECT_PORT) {
      let _ = self.inner.bridge.remove_forward(serial, snoop_port);
      return Err(Error::BridgeSetup(format!("{err:#}")));
    }

    match self.attach_streams(snoop_port, inject_port, Some(forwarded.clone())) {
      Ok(()) => Ok(()),
      Err(err) => {
        let serial = forwarded.serial.as_deref();
        let _ = self.inner.bridge.remove_forward(serial, snoop_port);
        let _ = self.inner.bridge.remove_forward(serial, inject_port);
        Err(err)
      }
    }
  }

  /// Open the session against already-forwarded loopback ports, bypassing the bridge.
  pub fn attach(&self, snoop_port: u16, inject_port: u16) -> Result<()> {
    self.attach_streams(snoop_port, inject_port, None)
  }

  fn attach_streams(
    &self,
    snoop_port: u16,
    inject_port: u16,
    forwarded: Option<Forwarded>,
  ) -> Result<()> {
    if self.is_running() {
      return Err(Error::Misuse("already connected; call shutdown() first".to_owned()));
    }

    let inject = InjectStream::connect(inject_port)?;
    let mut snoop = SnoopStream::connect(snoop_port)?;
    let mut capture = match &self.inner.shared.config.capture_log_path {
      Some(path) => Some(CaptureLog::create(path)?),
      None => None,
    };

    let Some(header_raw) = snoop.read_file_header()? else {
      return Err(Error::TransportLost("could not read btsnoop header".to_owned()));
    };
    if let Ok(header) = SnoopHeader::parse(&header_raw) {
      debug!(
        "snoop stream open (version {}, datalink {})",
        header.version, header.datalink
      );
    }
    if let Some(capture) = capture.as_mut() {
      capture.append(&header_raw);
    }

    let shared = &self.inner.shared;
    shared.exit_requested.store(false, Ordering::SeqCst);
    shared.crashed.store(false, Ordering::SeqCst);
    shared.send_alive.store(false, Ordering::SeqCst);
    shared.recv_queue.flush();
    shared.send_scoped_queue.flush();
    shared.send_queue.flush();

    let worker_shared = Arc::clone(shared);
    let recv_worker = thread::Builder::new()
      .name("bluetap-recv".to_owned())
      .spawn(move || run_recv_worker(snoop, capture, worker_shared))?;
    let worker_shared = Arc::clone(shared);
    let send_worker = match thread::Builder::new()
      .name("bluetap-send".to_owned())
      .spawn(move || run_send_worker(inject, worker_shared))
    {
      Ok(handle) => handle,
      Err(err) => {
        shared.exit_requested.store(true, Ordering::SeqCst);
        let _ = recv_worker.join();
        shared.exit_requested.store(false, Ordering::SeqCst);
        return Err(Error::Io(err));
      }
    };

    *self.inner.link.lock().unwrap() = Some(Link {
      recv_worker,
      send_worker,
      forwarded,
    });
    self.inner.running.store(true, Ordering::SeqCst);
    info!("session open (snoop :{snoop_port}, inject :{inject_port})");
    Ok(())
  }

  /// Stop all workers, tear down sockets and forwardings, and close the capture log.
  ///
  /// The session value stays usable; `connect` may be called again.
  pub fn shutdown(&self) -> Result<()> {
    let shared = &self.inner.shared;
    shared.exit_requested.store(true, Ordering::SeqCst);
    shared.monitor_exit_requested.store(true, Ordering::SeqCst);

    if let Some(handle) = self.take_monitor_handle() {
      if thread::current().id() != handle.thread_id {
        if handle.worker.join().is_err() {
          warn!("monitor worker panicked");
        }
      }
    }

    let link = self.inner.link.lock().unwrap().take();
    if let Some(link) = link {
      if link.recv_worker.join().is_err() {
        warn!("receive worker panicked");
      }
      if link.send_worker.join().is_err() {
        warn!("send worker panicked");
      }
      if let Some(forwarded) = link.forwarded {
        let serial = forwarded.serial.as_deref();
        if let Err(err) = self.inner.bridge.remove_forward(serial, forwarded.snoop_port) {
          warn!("could not remove snoop forwarding: {err:#}");
        }
        if let Err(err) = self.inner.bridge.remove_forward(serial, forwarded.inject_port) {
          warn!("could not remove inject forwarding: {err:#}");
        }
      }
    }

    self.inner.running.store(false, Ordering::SeqCst);
    shared.exit_requested.store(false, Ordering::SeqCst);
    info!("session shut down");
    Ok(())
  }

  /// Submit one HCI command and wait for its Command Complete payload.
  ///
  /// The returned bytes start with the credit count, followed by the echoed opcode and the
  /// command's return parameters. Interleaved asynchronous events never satisfy the wait.
  pub fn send_hci_command(&self, opcode: u16, params: &[u8], timeout: Duration) -> Result<Bytes> {
    self.check_running()?;
    if params.len() > u8::MAX as usize {
      return Err(Error::Misuse("HCI command parameters exceed 255 bytes".to_owned()));
    }
    let slot = Arc::new(ResponseSlot::new());
    let request = PendingCommand {
      opcode,
      params: Bytes::copy_from_slice(params),
      slot: Arc::clone(&slot),
    };
    if self.inner.shared.send_queue.push_timeout(request, timeout).is_err() {
      warn!("send queue full; command 0x{opcode:04X} not submitted");
      return Err(Error::CommandTimeout { opcode });
    }
    match slot.wait(timeout) {
      Some(data) => Ok(data),
      None => {
        warn!("no Command Complete for 0x{opcode:04X} within {timeout:?}");
        Err(Error::CommandTimeout { opcode })
      }
    }
  }

  /// Pop the next inbound record off the primary queue.
  pub fn recv_packet(&self, timeout: Duration) -> Result<Option<Record>> {
    self.check_running()?;
    Ok(self.inner.shared.recv_queue.pop_timeout(timeout))
  }

  /// Reject calls against a session that is absent, crashed, or winding down.
  pub(crate) fn check_running(&self) -> Result<()> {
    if !self.is_running() {
      return Err(Error::Misuse("not connected; call connect() first".to_owned()));
    }
    if self.inner.shared.crashed.load(Ordering::SeqCst) {
      return Err(Error::ControllerCrash);
    }
    if self.exit_requested() {
      return Err(Error::TransportLost(
        "session is terminating; call shutdown()".to_owned(),
      ));
    }
    Ok(())
  }

  pub(crate) fn assembler(&self) -> Option<Arc<dyn Assembler>> {
    self.inner.assembler.clone()
  }

  pub(crate) fn exit_flag(&self) -> &AtomicBool {
    &self.inner.shared.exit_requested
  }

  pub(crate) fn monitor_exit_flag(&self) -> &AtomicBool {
    &self.inner.shared.monitor_exit_requested
  }

  pub(crate) fn reset_monitor_exit(&self) {
    self.inner.shared.monitor_exit_requested.store(false, Ordering::SeqCst);
  }

  pub(crate) fn request_monitor_exit(&self) {
    self.inner.shared.monitor_exit_requested.store(true, Ordering::SeqCst);
  }

  pub(crate) fn set_monitor_state(&self, state: MonitorState) {
    self.inner.monitor_state.store(state as u8, Ordering::SeqCst);
  }

  pub(crate) fn monitor_handle_active(&self) -> bool {
    self.inner.monitor.lock().unwrap().is_some()
  }

  pub(crate) fn take_monitor_handle(&self) -> Option<MonitorHandle> {
    self.inner.monitor.lock().unwrap().take()
  }

  /// Drop the monitor handle, but only when called from the monitor thread itself; a handle
  /// owned by another thread stays put for that thread to join.
  pub(crate) fn clear_monitor_handle(&self) {
    let mut guard = self.inner.monitor.lock().unwrap();
    if guard.as_ref().map(|handle| handle.thread_id) == Some(thread::current().id()) {
      guard.take();
    }
  }

  /// Spawn the monitor worker; the handle slot is held locked across the spawn so the worker
  /// cannot observe it empty.
  pub(crate) fn spawn_monitor(&self, worker: MonitorWorker) -> Result<()> {
    let mut guard = self.inner.monitor.lock().unwrap();
    if guard.is_some() {
      return Err(Error::Misuse("monitor is already active".to_owned()));
    }
    let handle = thread::Builder::new()
      .name("bluetap-monitor".to_owned())
      .spawn(move || worker.run())?;
    *guard = Some(MonitorHandle {
      thread_id: handle.thread().id(),
      worker: handle,
    });
    Ok(())
  }

  pub(crate) fn patchram_table(&self) -> MutexGuard<'_, PatchramTable> {
    self.inner.patchram.lock().unwrap()
  }
}
