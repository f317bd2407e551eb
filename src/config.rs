//! Tuning knobs for HYPER clients and servers.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which leg of a session a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Carries requests, handshakes and file-check results.
    Control,
    /// Carries segment data.
    Transfer,
}

impl Role {
    pub fn from_control_flag(is_control: bool) -> Self {
        if is_control {
            Role::Control
        } else {
            Role::Transfer
        }
    }

    pub fn is_control(self) -> bool {
        self == Role::Control
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperConfig {
    pub control_connections: usize,
    pub transfer_connections: usize,

    /// Socket receive buffer for control legs (bytes)
    pub control_receive_buffer: u32,
    /// Socket receive buffer for transfer legs (bytes)
    pub transfer_receive_buffer: u32,
    /// Bytes requested per socket read
    pub read_chunk_size: usize,

    /// Size of each pooled buffer, which is also the largest segment payload
    pub segment_buffer_size: usize,
    /// Buffers kept around by the pool once returned
    pub pooled_buffers: usize,

    pub segment_queue_depth: usize,
    pub file_check_queue_depth: usize,
    pub storage_queue_depth: usize,

    pub segment_timeout_ms: u64,
    pub file_check_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub reconnect_idle_ms: u64,
    pub validate_interval_ms: u64,
}

impl Default for HyperConfig {
    fn default() -> Self {
        Self {
            control_connections: 2,
            transfer_connections: 4,
            control_receive_buffer: 64 * 1024,
            transfer_receive_buffer: 4 * 1024 * 1024,
            read_chunk_size: 256 * 1024,
            segment_buffer_size: 1024 * 1024,
            pooled_buffers: 64,
            segment_queue_depth: 64,
            file_check_queue_depth: 256,
            storage_queue_depth: 1024,
            segment_timeout_ms: 4_000,
            file_check_timeout_ms: 60_000,
            sweep_interval_ms: 1_000,
            reconnect_idle_ms: 5_000,
            validate_interval_ms: 1_000,
        }
    }
}

impl HyperConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Receive buffer size for a connection of the given role.
    pub fn receive_buffer(&self, role: Role) -> u32 {
        match role {
            Role::Control => self.control_receive_buffer,
            Role::Transfer => self.transfer_receive_buffer,
        }
    }

    pub fn desired_connections(&self, role: Role) -> usize {
        match role {
            Role::Control => self.control_connections,
            Role::Transfer => self.transfer_connections,
        }
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout_ms)
    }

    pub fn file_check_timeout(&self) -> Duration {
        Duration::from_millis(self.file_check_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reconnect_idle(&self) -> Duration {
        Duration::from_millis(self.reconnect_idle_ms)
    }

    pub fn validate_interval(&self) -> Duration {
        Duration::from_millis(self.validate_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = HyperConfig::from_toml_str("").unwrap();
        assert_eq!(config, HyperConfig::default());
        assert_eq!(config.segment_timeout(), Duration::from_secs(4));
        assert_eq!(config.file_check_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_override() {
        let config = HyperConfig::from_toml_str(
            "control_connections = 1\ntransfer_connections = 8\nsegment_queue_depth = 2\n",
        )
        .unwrap();
        assert_eq!(config.control_connections, 1);
        assert_eq!(config.transfer_connections, 8);
        assert_eq!(config.segment_queue_depth, 2);
        assert_eq!(config.reconnect_idle(), Duration::from_secs(5));
    }

    #[test]
    fn test_receive_buffer_depends_on_role() {
        let config = HyperConfig::default();
        assert!(config.receive_buffer(Role::Transfer) > config.receive_buffer(Role::Control));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = HyperConfig::from_toml_str("control_connections = \"many\"").unwrap_err();
        assert!(matches!(err, crate::error::HyperError::Config(_)));
    }
}
