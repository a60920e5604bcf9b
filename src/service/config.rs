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

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Message id reserved for heartbeat traffic unless overridden.
pub const DEFAULT_HEARTBEAT_MSG_ID: u32 = 11111;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub name: String,
    pub print_banner: bool,
    /// logs are also written to this file when non-empty
    pub log_file_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            name: "DefaultName".to_string(),
            print_banner: true,
            log_file_name: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// one of `tcp`, `tcp4`, `tcp6`
    pub tcp_version: String,
    pub max_conn: usize,
    /// max payload length of a single frame, 0 means unlimited
    pub max_packet_size: u32,
    /// depth of the buffered outbound queue of every connection
    pub max_msg_chan_len: usize,
    /// seconds without inbound traffic before a connection is considered dead, 0 disables
    pub max_heartbeat_time: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 6177,
            tcp_version: "tcp4".to_string(),
            max_conn: 12000,
            max_packet_size: 0,
            max_msg_chan_len: 1024,
            max_heartbeat_time: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// number of workers, 0 dispatches every request onto its own task
    pub size: usize,
    pub max_task_len: usize,
    /// how often the monitor looks for workers that died
    pub monitor_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            size: 10,
            max_task_len: 1024,
            monitor_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// seconds between probes, 0 leaves the checker off
    pub interval: u64,
    pub msg_id: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval: 0,
            msg_id: DEFAULT_HEARTBEAT_MSG_ID,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub crt_file_name: String,
    pub key_file_name: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            enabled: false,
            crt_file_name: "crt.pem".to_string(),
            key_file_name: "key.pem".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HambleConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub worker_pool: WorkerPoolConfig,
    pub heartbeat: HeartbeatConfig,
    pub tls: TlsConfig,
}

impl HambleConfig {
    /// Loads the configuration from `path`, layered over the built-in defaults and
    /// overridden by `HAMBLE__SECTION__FIELD` environment variables.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<HambleConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&HambleConfig::default())?)
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("HAMBLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let hamble_config: HambleConfig = config.try_deserialize()?;
        hamble_config.validate()?;
        Ok(hamble_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !matches!(self.network.tcp_version.as_str(), "tcp" | "tcp4" | "tcp6") {
            return Err(AppError::InvalidValue(format!(
                "tcp_version must be tcp, tcp4 or tcp6, got {}",
                self.network.tcp_version
            )));
        }
        if self.network.max_msg_chan_len == 0 {
            return Err(AppError::InvalidValue(
                "max_msg_chan_len must be > 0".to_string(),
            ));
        }
        if self.worker_pool.size > 0 && self.worker_pool.max_task_len == 0 {
            return Err(AppError::InvalidValue(
                "max_task_len must be > 0 when the worker pool is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_heartbeat_time(&self) -> Option<Duration> {
        match self.network.max_heartbeat_time {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat.interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }

    /// Resolves host and port, keeping only addresses of the configured family.
    pub async fn resolve_address(&self) -> AppResult<SocketAddr> {
        let address = self.listen_address();
        let mut candidates = tokio::net::lookup_host(&address).await?;
        let wanted = self.network.tcp_version.as_str();
        candidates
            .find(|addr| match wanted {
                "tcp4" => addr.is_ipv4(),
                "tcp6" => addr.is_ipv6(),
                _ => true,
            })
            .ok_or_else(|| {
                AppError::InvalidValue(format!("no {} address found for {}", wanted, address))
            })
    }

    /// Human readable dump of the active profile, printed at server start.
    pub fn print(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "======================================================");
        let _ = writeln!(out, "*                    HambleConfig                    *");
        let _ = writeln!(out, "======================================================");
        let _ = writeln!(out, "    name: {}", self.general.name);
        let _ = writeln!(out, "    host: {}", self.network.host);
        let _ = writeln!(out, "    port: {}", self.network.port);
        let _ = writeln!(out, "    tcp_version: {}", self.network.tcp_version);
        let _ = writeln!(out, "    max_conn: {}", self.network.max_conn);
        let _ = writeln!(out, "    max_packet_size: {}", self.network.max_packet_size);
        let _ = writeln!(out, "    max_msg_chan_len: {}", self.network.max_msg_chan_len);
        let _ = writeln!(out, "    max_heartbeat_time: {}", self.network.max_heartbeat_time);
        let _ = writeln!(out, "    worker_pool_size: {}", self.worker_pool.size);
        let _ = writeln!(out, "    max_worker_task_len: {}", self.worker_pool.max_task_len);
        let _ = writeln!(out, "    heartbeat_interval: {}", self.heartbeat.interval);
        let _ = writeln!(out, "    heartbeat_msg_id: {}", self.heartbeat.msg_id);
        let _ = writeln!(out, "    log_file_name: {}", self.general.log_file_name);
        let _ = writeln!(out, "    tls: {}", self.tls.enabled);
        let _ = writeln!(out, "    crt_file_name: {}", self.tls.crt_file_name);
        let _ = writeln!(out, "    key_file_name: {}", self.tls.key_file_name);
        let _ = writeln!(out, "======================================================");
        out
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = HambleConfig::default();
        assert_eq!(config.network.port, 6177);
        assert_eq!(config.network.max_packet_size, 0);
        assert_eq!(config.worker_pool.size, 10);
        assert_eq!(config.heartbeat.msg_id, DEFAULT_HEARTBEAT_MSG_ID);
        assert_eq!(config.max_heartbeat_time(), Some(Duration::from_secs(10)));
        assert_eq!(config.heartbeat_interval(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[network]\nport = 7000\nmax_packet_size = 4096\n\n[worker_pool]\nsize = 4"
        )
        .unwrap();

        let config = HambleConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.max_packet_size, 4096);
        assert_eq!(config.worker_pool.size, 4);
        // untouched fields fall back to defaults
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.worker_pool.max_task_len, 1024);
        assert_eq!(config.general.name, "DefaultName");
    }

    #[test]
    fn test_env_overrides_file() {
        // fields no other test reads back, the environment is shared by parallel tests
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[network]\nmax_conn = 100\n\n[heartbeat]\ninterval = 3").unwrap();

        std::env::set_var("HAMBLE__NETWORK__MAX_CONN", "200");
        std::env::set_var("HAMBLE__HEARTBEAT__MSG_ID", "42");
        let config = HambleConfig::set_up_config(file.path());
        std::env::remove_var("HAMBLE__NETWORK__MAX_CONN");
        std::env::remove_var("HAMBLE__HEARTBEAT__MSG_ID");

        let config = config.unwrap();
        assert_eq!(config.network.max_conn, 200);
        assert_eq!(config.heartbeat.msg_id, 42);
        // the file still applies where the environment is silent
        assert_eq!(config.heartbeat.interval, 3);
    }

    #[test]
    fn test_reject_unknown_tcp_version() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[network]\ntcp_version = \"udp\"").unwrap();

        let err = HambleConfig::set_up_config(file.path()).unwrap_err();
        assert!(matches!(err, AppError::InvalidValue(_)));
    }

    #[test]
    fn test_zero_disables_heartbeat_timeout() {
        let mut config = HambleConfig::default();
        config.network.max_heartbeat_time = 0;
        assert_eq!(config.max_heartbeat_time(), None);
    }

    #[tokio::test]
    async fn test_resolve_ipv4_only() {
        let mut config = HambleConfig::default();
        config.network.host = "127.0.0.1".to_string();
        config.network.port = 0;
        let addr = config.resolve_address().await.unwrap();
        assert!(addr.is_ipv4());
    }
}
