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

//! Host-Controller Interface wire model: frame codecs, the H4 packet sum, the btsnoop v1 stream
//! format, and controller crash detection.

#![forbid(unsafe_code)]

pub mod codec;
pub mod packet;
pub mod snoop;
pub mod stackdump;

pub use packet::{HciPacket, PacketError, EVT_COMMAND_COMPLETE, EVT_VENDOR};
pub use snoop::{RecordHeader, SnoopError, SnoopHeader, FILE_HEADER_LEN, RECORD_HEADER_LEN};
pub use stackdump::StackDumpDetector;
