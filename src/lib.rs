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

mod message;
mod network;
pub mod protocol;
mod service;

pub use message::{HeapAllocator, Message, MessageAllocator};
pub use network::{
    Connection, ConnectionHandle, ConnectionState, EngineStats, Handle, ListenerHandle,
    NetCallback, NetEngine, NetEvent,
};
pub use protocol::{FrameLength, Method, ProtocolHeader};
pub use service::{
    load_config_file, setup_local_tracing, setup_tracing, verbosity_level, ConnectionConfig,
    EngineConfig, ErrorCode, ListenerConfig, NetEngineType, NetError, NetResult, SocketOptions,
    TracingGuard, SECTION,
};
