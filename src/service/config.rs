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

extern crate config as rs_config;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{NetError, NetResult};

/// Name of the section every engine, listener and connection key lives under.
pub const SECTION: &str = "net_engine";

const ENV_PREFIX: &str = "LIDR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetEngineType {
    #[default]
    Tcp,
    Udp,
    P2p,
}

impl fmt::Display for NetEngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetEngineType::Tcp => "tcp",
            NetEngineType::Udp => "udp",
            NetEngineType::P2p => "p2p",
        };
        f.write_str(name)
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub net_engine_type: NetEngineType,
    pub net_engine_name: String,
    pub io_thread_count: u32,
    /// 0 keeps the OS default
    pub socket_buffer_bytes: u32,
    /// 0 disables pings
    pub heartbeat_interval_ms: u32,
    /// 0 disables expiry
    pub heartbeat_timeout_ms: u32,
    pub call_timeout_ms: u32,
    /// budget of the default message allocator, 0 means unlimited
    pub max_memory_mb: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            net_engine_type: NetEngineType::Tcp,
            net_engine_name: "anonymous_net_engine".to_string(),
            io_thread_count: 1,
            socket_buffer_bytes: 0,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 30000,
            call_timeout_ms: 5000,
            max_memory_mb: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub listener_name: String,
    pub listener_ip: String,
    pub listener_port: u16,
    pub socket_buffer_bytes: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
    pub heartbeat_timeout_ms: Option<u32>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listener_name: "anonymous_listener".to_string(),
            listener_ip: "0.0.0.0".to_string(),
            listener_port: 8080,
            socket_buffer_bytes: None,
            heartbeat_interval_ms: None,
            heartbeat_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connection_name: String,
    pub connection_remote_ip: String,
    pub connection_remote_port: u16,
    pub socket_buffer_bytes: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
    pub heartbeat_timeout_ms: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_name: "anonymous_connection".to_string(),
            connection_remote_ip: "127.0.0.1".to_string(),
            connection_remote_port: 8080,
            socket_buffer_bytes: None,
            heartbeat_interval_ms: None,
            heartbeat_timeout_ms: None,
        }
    }
}

/// Socket and liveness settings resolved for one listener or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub socket_buffer_bytes: u32,
    pub heartbeat_interval_ms: u32,
    pub heartbeat_timeout_ms: u32,
}

impl SocketOptions {
    pub fn resolve(
        engine: &EngineConfig,
        socket_buffer_bytes: Option<u32>,
        heartbeat_interval_ms: Option<u32>,
        heartbeat_timeout_ms: Option<u32>,
    ) -> NetResult<SocketOptions> {
        let options = SocketOptions {
            socket_buffer_bytes: socket_buffer_bytes.unwrap_or(engine.socket_buffer_bytes),
            heartbeat_interval_ms: heartbeat_interval_ms.unwrap_or(engine.heartbeat_interval_ms),
            heartbeat_timeout_ms: heartbeat_timeout_ms.unwrap_or(engine.heartbeat_timeout_ms),
        };
        check_heartbeat(options.heartbeat_interval_ms, options.heartbeat_timeout_ms)?;
        Ok(options)
    }
}

fn check_heartbeat(interval_ms: u32, timeout_ms: u32) -> NetResult<()> {
    if interval_ms != 0 && timeout_ms != 0 && timeout_ms < interval_ms {
        return Err(NetError::InvalidParam(format!(
            "heartbeat timeout {}ms is shorter than heartbeat interval {}ms",
            timeout_ms, interval_ms
        )));
    }
    Ok(())
}

/// Reads a config file (toml, json, yaml ... by extension) with `LIDR__NET_ENGINE__*`
/// environment overrides on top.
pub fn load_config_file<P: AsRef<Path>>(path: P) -> NetResult<rs_config::Config> {
    let path_str = path.as_ref().to_str().ok_or(NetError::InvalidParam(format!(
        "config file path: {}",
        path.as_ref().to_string_lossy()
    )))?;
    let config = rs_config::Config::builder()
        .add_source(rs_config::File::with_name(path_str))
        .add_source(
            rs_config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(config)
}

/// Deserializes the `net_engine` section, falling back to defaults when it is absent.
fn section<T>(source: &rs_config::Config) -> NetResult<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match source.get::<T>(SECTION) {
        Ok(value) => Ok(value),
        Err(rs_config::ConfigError::NotFound(_)) => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

impl EngineConfig {
    pub fn from_source(source: &rs_config::Config) -> NetResult<EngineConfig> {
        let config: EngineConfig = section(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> NetResult<EngineConfig> {
        Self::from_source(&load_config_file(path)?)
    }

    pub fn validate(&self) -> NetResult<()> {
        if self.io_thread_count == 0 {
            return Err(NetError::InvalidParam(
                "io_thread_count must be at least 1".to_string(),
            ));
        }
        if self.net_engine_name.is_empty() {
            return Err(NetError::InvalidParam(
                "net_engine_name must not be empty".to_string(),
            ));
        }
        check_heartbeat(self.heartbeat_interval_ms, self.heartbeat_timeout_ms)
    }
}

impl ListenerConfig {
    pub fn from_source(source: &rs_config::Config) -> NetResult<ListenerConfig> {
        section(source)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listener_ip, self.listener_port)
    }
}

impl ConnectionConfig {
    pub fn from_source(source: &rs_config::Config) -> NetResult<ConnectionConfig> {
        section(source)
    }

    /// `host:port`, with brackets around IPv6 literals.
    pub fn remote_address(&self) -> String {
        if self.connection_remote_ip.contains(':') {
            format!("[{}]:{}", self.connection_remote_ip, self.connection_remote_port)
        } else {
            format!("{}:{}", self.connection_remote_ip, self.connection_remote_port)
        }
    }
}
