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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AppError, AppResult};
use crate::network::PeerId;

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// node identity announced in every handshake, a random one is generated when absent
    pub node_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen: String,
    pub max_payload_size: u32,
    /// upper bound on concurrent reactor registrations
    pub max_connections: usize,
    pub listen_backlog: i32,
    /// seed peers dialed at startup
    pub peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            listen: "tcp://0.0.0.0:7878".to_string(),
            max_payload_size: 16 * 1024 * 1024,
            max_connections: 4096,
            listen_backlog: 1024,
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub idle_secs: u64,
    pub interval_secs: u64,
    pub count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            idle_secs: 60,
            interval_secs: 10,
            count: 5,
        }
    }
}

impl KeepaliveConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// 0 means one worker per cpu
    pub num_workers: usize,
    pub thread_stack_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            num_workers: 0,
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl WorkerPoolConfig {
    pub fn worker_threads(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get()
        } else {
            self.num_workers
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DialerConfig {
    pub retry_interval_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for DialerConfig {
    fn default() -> Self {
        DialerConfig {
            retry_interval_ms: 5000,
            sweep_interval_ms: 1000,
        }
    }
}

impl DialerConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub keepalive: KeepaliveConfig,
    pub worker_pool: WorkerPoolConfig,
    pub dialer: DialerConfig,
}

impl NodeConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NodeConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let node_config: NodeConfig = config.try_deserialize()?;
        node_config.validate()?;
        Ok(node_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.dialer.sweep_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "dialer.sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.network.max_connections == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connections must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn node_id(&self) -> PeerId {
        self.general
            .node_id
            .map(PeerId::from)
            .unwrap_or_else(PeerId::random)
    }
}
