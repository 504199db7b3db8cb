use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Boot-time configuration — loaded once from environment variables
// ---------------------------------------------------------------------------

/// Physical, process-lifetime configuration. Unlike [`ConfigSnapshot`], these
/// values cannot change without a restart.
///
/// Every field can be set via an environment variable prefixed with `HOOKLINE_`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP listener to.
    pub bind_addr: String,
    /// Directory used for keyed storage (webhook identities, config snapshot).
    pub data_dir: PathBuf,
    pub allowed_origins: String,
    pub log_level: String,
    /// How often the hot-reload watcher polls keyed storage, in milliseconds.
    pub reload_poll_ms: u64,
    /// Optional local file watched in addition to keyed storage (§4.13).
    pub reload_watch_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let bind_addr = env_or("HOOKLINE_BIND_ADDR", "0.0.0.0:8080");
        let data_dir = std::env::var("HOOKLINE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let allowed_origins = env_or("HOOKLINE_ALLOWED_ORIGINS", "*");
        let log_level = env_or("HOOKLINE_LOG_LEVEL", "info");
        let reload_poll_ms = env_or("HOOKLINE_RELOAD_POLL_MS", "5000")
            .parse::<u64>()
            .unwrap_or(5000);
        let reload_watch_file = std::env::var("HOOKLINE_RELOAD_WATCH_FILE")
            .ok()
            .map(PathBuf::from);

        let config = Config {
            bind_addr,
            data_dir,
            allowed_origins,
            log_level,
            reload_poll_ms,
            reload_watch_file,
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── hookline configuration ────");
        info!("  bind_addr       : {}", self.bind_addr);
        info!("  data_dir        : {}", self.data_dir.display());
        info!(
            "  cors_origins    : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level       : {}", self.log_level);
        info!("  reload_poll_ms  : {}", self.reload_poll_ms);
        info!("─────────────────────────────────");
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hookline")
}

// ---------------------------------------------------------------------------
// Hot-reloadable configuration snapshot (spec §3 "Configuration Snapshot")
// ---------------------------------------------------------------------------

/// Describes how inbound signatures are verified for a webhook (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureConfig {
    pub provider: SignatureProvider,
    pub secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_key: Option<String>,
    /// Tolerance in seconds for timestamp-carrying providers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignatureProvider {
    Github,
    Shopify,
    Stripe,
    Slack,
    Custom,
}

/// The mutable, runtime-reconfigurable half of server configuration. This is
/// the value diffed and swapped by hot-reload (§4.13, §5): readers take a
/// clone of the `Arc` once per request so that a single request always sees
/// one consistent snapshot even if a reload lands mid-request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    pub url_count: u32,
    pub retention_hours: u32,
    pub max_payload_size: usize,
    pub rate_limit_per_minute: u32,
    pub allowed_ips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_url: Option<String>,
    pub forward_headers: bool,
    pub max_forward_retries: u32,
    pub replay_max_retries: u32,
    pub replay_timeout_ms: u64,
    pub response_delay_ms: u64,
    pub mask_sensitive_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_verification: Option<SignatureConfig>,
    pub enable_json_parsing: bool,
    pub use_fixed_memory: bool,
    pub fixed_memory_mbytes: u32,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            auth_key: std::env::var("HOOKLINE_AUTH_KEY").ok().filter(|s| !s.is_empty()),
            url_count: 1,
            retention_hours: 24,
            max_payload_size: 5 * 1024 * 1024,
            rate_limit_per_minute: 60,
            allowed_ips: Vec::new(),
            forward_url: None,
            forward_headers: true,
            max_forward_retries: 3,
            replay_max_retries: 3,
            replay_timeout_ms: 10_000,
            response_delay_ms: 0,
            mask_sensitive_data: true,
            custom_script: None,
            json_schema: None,
            signature_verification: None,
            enable_json_parsing: true,
            use_fixed_memory: false,
            fixed_memory_mbytes: 256,
        }
    }
}

impl ConfigSnapshot {
    /// Diff `self` against `other`, returning the field names that changed.
    /// Used by the hot-reload watcher to log what an applied reload actually
    /// touched (§4.13, §9 "diff-based apply function").
    pub fn diff(&self, other: &ConfigSnapshot) -> Vec<&'static str> {
        let mut changed = Vec::new();
        macro_rules! check {
            ($field:ident) => {
                if self.$field != other.$field {
                    changed.push(stringify!($field));
                }
            };
        }
        check!(auth_key);
        check!(url_count);
        check!(retention_hours);
        check!(max_payload_size);
        check!(rate_limit_per_minute);
        check!(allowed_ips);
        check!(forward_url);
        check!(forward_headers);
        check!(max_forward_retries);
        check!(replay_max_retries);
        check!(replay_timeout_ms);
        check!(response_delay_ms);
        check!(mask_sensitive_data);
        check!(custom_script);
        check!(json_schema);
        check!(signature_verification);
        check!(enable_json_parsing);
        check!(use_fixed_memory);
        check!(fixed_memory_mbytes);
        changed
    }
}

// ---------------------------------------------------------------------------
// Keyed storage — a small JSON-file-backed key/value store
// ---------------------------------------------------------------------------

/// Faithful, minimal implementation of the "keyed storage" the spec treats
/// as an ambient collaborator (§6 "Persisted state"): one JSON file per key
/// under the configured data directory. Good enough for the two values this
/// system actually needs (`WEBHOOKS`, `INPUT`) without pulling in a database
/// crate the teacher never uses.
#[derive(Debug, Clone)]
pub struct KeyedStorage {
    dir: PathBuf,
}

impl KeyedStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Read and deserialize a key. Missing or corrupt state is treated as
    /// absent — callers decide whether that means "empty" or an error.
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, %err, "keyed storage value is corrupt, treating as absent");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec_pretty(value)?;
        std::fs::write(self.path_for(key), bytes)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
