// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! LIDR wire protocol.
//!
//! Every frame starts with a fixed 16-byte header:
//!
//! | field | size |
//! |---|---|
//! | magic `LIDR` | 4 |
//! | total length | 4 |
//! | header length | 1 |
//! | version | 1 |
//! | sequence | 2 |
//! | method | 2 |
//! | option offset | 1 |
//! | flags | 1 |
//!
//! followed by `header length - 16` option bytes and the payload. The engine only reads
//! what it needs to find frame boundaries, match call responses and answer heartbeats;
//! options and payloads go to the handlers untouched.

pub use codec::{probe_frame_length, FrameLength};
pub use header::{
    heartbeat_frame, heartbeat_kind, peek_sequence, write_sequence, Heartbeat, Method,
    ProtocolHeader, Version, CURRENT_VERSION, FIXED_HEADER_LEN, FLAG_PONG, MAGIC,
};

mod codec;
mod header;
