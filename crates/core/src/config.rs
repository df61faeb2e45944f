//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Fully qualified host name, used only when rendering the published
    /// registries index for external consumers.
    #[serde(default)]
    pub host_name: Option<String>,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            host_name: None,
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Upstream storage server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URLs of the storage servers, e.g. "http://storage-1:8080".
    pub servers: Vec<String>,
    /// Per-probe timeout in seconds for HEAD requests.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Number of retries per HEAD probe after the first attempt.
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_probe_retries() -> u32 {
    2
}

impl UpstreamConfig {
    /// Get the probe timeout as a Duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// On-disk cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory; cache/, temp/ and static/ live underneath.
    pub root: PathBuf,
    /// Total cache size budget in bytes.
    #[serde(default = "default_size_limit_bytes")]
    pub size_limit_bytes: u64,
}

fn default_size_limit_bytes() -> u64 {
    50 * 1024 * 1024 * 1024 // 50 GiB
}

impl CacheConfig {
    /// Directory holding committed cache files.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Directory holding in-progress staging files. Safe to wipe on startup.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Directory holding published state such as the registries index.
    pub fn static_dir(&self) -> PathBuf {
        self.root.join("static")
    }
}

/// One tracked registry and its authoritative origin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry UUID as it appears in resource paths.
    pub uuid: Uuid,
    /// Origin archive URL template containing a `{hash}` placeholder,
    /// e.g. "https://forge.example.org/pkgs/acme/archive/{hash}.tar.gz".
    pub origin_url: String,
}

impl RegistryConfig {
    /// Render the origin archive URL for a concrete tree hash.
    pub fn origin_archive_url(&self, hash: &crate::resource::TreeHash) -> String {
        self.origin_url.replace("{hash}", &hash.to_hex())
    }
}

/// Registry tracker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Seconds between registry poll ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    300
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl TrackerConfig {
    /// Get the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream storage servers (required).
    pub upstream: UpstreamConfig,
    /// On-disk cache configuration (required).
    pub cache: CacheConfig,
    /// Registry tracker configuration.
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Tracked registries.
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
}

impl AppConfig {
    /// Validate configuration invariants. Returns the first violation found.
    pub fn validate(&self) -> crate::Result<()> {
        if self.upstream.servers.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "upstream.servers must list at least one storage server".to_string(),
            ));
        }
        for server in &self.upstream.servers {
            if !server.starts_with("http://") && !server.starts_with("https://") {
                return Err(crate::Error::InvalidConfig(format!(
                    "upstream server is not an http(s) URL: {server}"
                )));
            }
            if server.ends_with('/') {
                return Err(crate::Error::InvalidConfig(format!(
                    "upstream server URL must not end with a slash: {server}"
                )));
            }
        }
        if self.cache.size_limit_bytes == 0 {
            return Err(crate::Error::InvalidConfig(
                "cache.size_limit_bytes must be non-zero".to_string(),
            ));
        }
        if self.tracker.poll_interval_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "tracker.poll_interval_secs must be non-zero".to_string(),
            ));
        }
        for registry in &self.registries {
            if !registry.origin_url.contains("{hash}") {
                return Err(crate::Error::InvalidConfig(format!(
                    "registry {} origin_url is missing the {{hash}} placeholder",
                    registry.uuid
                )));
            }
        }
        Ok(())
    }

    /// Create a test configuration rooted at the given directory.
    ///
    /// **For testing only.**
    pub fn for_testing(root: PathBuf, servers: Vec<String>) -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                servers,
                probe_timeout_secs: 2,
                probe_retries: 0,
            },
            cache: CacheConfig {
                root,
                size_limit_bytes: 64 * 1024 * 1024,
            },
            tracker: TrackerConfig::default(),
            registries: Vec::new(),
        }
    }
}
