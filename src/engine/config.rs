extern crate config as _;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::packet::PacketLimits;

use super::{EngineError, EngineResult};

/// Which readiness model drives a manager's sockets.
///
/// `Select` maps to the scanning sweep driver, `Epoll`/`Iocp`/`Kqueue`
/// to the per-socket readiness watchers, `IoUring` to the submission /
/// completion queue driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MuxMode {
    Select,
    #[default]
    Epoll,
    IoUring,
    Iocp,
    Kqueue,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketType {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub channel_capacity: usize,
    /// 0 means one channel per logical cpu
    pub num_channels: i8,
    /// seconds between worker health checks
    pub monitor_interval: u64,
    /// milliseconds to wait when probing a worker handle
    pub worker_check_timeout: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: 0,
            monitor_interval: 5,
            worker_check_timeout: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// manager name, used in logs
    pub name: String,
    pub mode: MuxMode,
    pub socket_type: SocketType,
    /// "ip:port" to bind (servers); empty for a pure client pool
    pub address: String,
    /// hard cap on concurrent connections
    pub max_count: usize,
    /// expected steady-state connection count, sizes internal tables
    pub default_count: usize,
    pub packet_limit: PacketLimits,
    pub executor: ExecutorConfig,
    /// default deadline for rpc calls, 0 disables it
    pub call_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "stonelink".into(),
            mode: MuxMode::default(),
            socket_type: SocketType::default(),
            address: String::new(),
            max_count: 4096,
            default_count: 128,
            packet_limit: PacketLimits::default(),
            executor: ExecutorConfig::default(),
            call_timeout_ms: 0,
        }
    }
}

impl EngineConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> EngineResult<EngineConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(EngineError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let engine_config: EngineConfig = config.try_deserialize()?;

        Ok(engine_config)
    }
}
