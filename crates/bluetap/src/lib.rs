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

//! Instrumentation harness for Broadcom Bluetooth controllers.
//!
//! A [`Session`] tunnels HCI over two TCP streams forwarded into a phone by the device bridge,
//! multiplexes synchronous command/response traffic over the injection socket while capturing
//! the asynchronous snoop stream, and builds memory access, ROM patching and live LMP
//! monitoring on top of the vendor command set.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod lmp;
pub mod memory;
pub mod monitor;
pub mod session;

mod pipeline;
mod queue;
mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use bridge::BridgeDevice;
pub use config::Config;
pub use error::{Error, Result};
pub use lmp::ConnectionInfo;
pub use memory::{MemChunk, PatchSlot, VSC_LAUNCH_RAM, VSC_READ_RAM, VSC_WRITE_RAM};
pub use monitor::{LmpCallback, LmpEvent, MonitorState};
pub use pipeline::Record;
pub use session::Session;
