//! Veil configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VeilConfig {
    /// Device and worker settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// In-process bus used by the daemon
    #[serde(default)]
    pub loopback: LoopbackConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Deferred signal workers (0 = one per available processor)
    #[serde(default)]
    pub deferred_workers: usize,

    /// Signals each deferred worker can hold before new ones are dropped
    #[serde(default = "default_deferred_queue_depth")]
    pub deferred_queue_depth: usize,

    /// Cancelled requests the cleanup worker can hold before cancel blocks
    #[serde(default = "default_cleanup_queue_depth")]
    pub cleanup_queue_depth: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            deferred_workers: 0,
            deferred_queue_depth: default_deferred_queue_depth(),
            cleanup_queue_depth: default_cleanup_queue_depth(),
        }
    }
}

/// Loopback bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Domain the loopback pretends to be
    #[serde(default)]
    pub domain_id: u16,

    /// Page budget for grant buffers
    #[serde(default = "default_memory_limit_pages")]
    pub memory_limit_pages: u64,

    /// Processor count reported to signal handlers
    #[serde(default = "default_processors")]
    pub processors: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            domain_id: 0,
            memory_limit_pages: default_memory_limit_pages(),
            processors: default_processors(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket path for IPC
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_deferred_queue_depth() -> usize {
    256
}

fn default_cleanup_queue_depth() -> usize {
    64
}

fn default_memory_limit_pages() -> u64 {
    4 * 1024 * 1024 // 16 GiB of sparse frames
}

fn default_processors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_socket_path() -> String {
    "/run/veil/veil.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl VeilConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
