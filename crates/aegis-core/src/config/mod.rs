//! Agent configuration.
//!
//! Configuration is loaded once at startup and is immutable for the
//! process lifetime. Sources are merged in order, later overriding
//! earlier:
//!
//! 1. embedded defaults
//! 2. the `[agent]` section of an INI file at
//!    `<exe-dir>/config/agent_config.ini` (or the path named by
//!    `AGENT_CONFIG_PATH`)
//! 3. `AGENT_*` environment variables
//!
//! Canonical identifiers (`tenant_id`, `asset_id`, `identity_id`) that are
//! still empty after the merge are auto-detected from the host; startup
//! fails if any remain empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Configuration errors. Fatal on startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// One or more canonical identifiers is empty.
    #[error("missing canonical identifiers")]
    MissingIdentifiers,

    /// A numeric option could not be parsed.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// The offending option key.
        key: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },
}

/// Immutable agent configuration, shared read-only across all tasks.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the control-plane transport.
    pub transport_url: String,
    /// Base URL for evidence/patch-result ingestion. Defaults to
    /// `transport_url` when not set separately.
    pub ingestion_url: String,
    /// Tenant scoping identifier.
    pub tenant_id: String,
    /// Asset scoping identifier (the managed host).
    pub asset_id: String,
    /// Identity scoping identifier.
    pub identity_id: String,
    /// Agent build version reported in heartbeats.
    pub agent_version: String,
    /// Host name reported in heartbeats.
    pub hostname: String,
    /// Operating system name reported in heartbeats.
    pub os_name: String,
    /// Trust state label (`bootstrap` until attested).
    pub trust_state: String,
    /// Tenant shared key for HMAC request signing.
    pub shared_key: SecretString,
    /// Optional API key attached as `X-API-Key`.
    pub api_key: Option<String>,
    /// Client certificate fingerprint reported on the legacy heartbeat
    /// path.
    pub cert_fingerprint: String,
    /// Value of the `X-Agent-Identity` / `X-Client-Identity` header.
    pub identity_header: String,
    /// Base heartbeat cadence in seconds.
    pub heartbeat_interval_seconds: i64,
    /// Cap for heartbeat backoff in seconds.
    pub max_heartbeat_interval_seconds: i64,
    /// Watchdog stall threshold in seconds.
    pub watchdog_timeout_seconds: u64,
    /// Patch-job command poll cadence in seconds.
    pub patch_poll_interval_seconds: u64,
    /// Expected SHA-256 of the agent binary; empty disables the check.
    pub expected_binary_hash: String,
    /// Spool directory for the uplink queue.
    pub uplink_queue_dir: PathBuf,
}

impl Config {
    /// Load configuration from the default sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingIdentifiers`] if canonical
    /// identifiers cannot be resolved, or [`ConfigError::InvalidValue`]
    /// for malformed numeric options.
    pub fn load() -> Result<Self, ConfigError> {
        let ini = std::fs::read_to_string(resolve_config_path())
            .map(|content| parse_agent_ini(&content))
            .unwrap_or_default();
        Self::from_sources(&ini, |key| std::env::var(key).ok())
    }

    /// Build configuration from explicit sources. `env` is consulted for
    /// `AGENT_*` overrides and host-detection fallbacks.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn from_sources(
        ini: &HashMap<String, String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // Later sources override earlier ones: env beats INI beats the
        // embedded default.
        let opt = |key: &str, var: &str| -> Option<String> {
            env(var)
                .filter(|value| !value.is_empty())
                .or_else(|| ini.get(key).filter(|value| !value.is_empty()).cloned())
        };
        let get = |key: &str, var: &str, fallback: &str| -> String {
            opt(key, var).unwrap_or_else(|| fallback.to_string())
        };

        let transport_url = get("transport_url", "AGENT_TRANSPORT_URL", "https://localhost:8081");
        let ingestion_url = opt("ingestion_url", "AGENT_INGESTION_URL")
            .unwrap_or_else(|| transport_url.clone());

        let mut hostname = get("hostname", "AGENT_HOSTNAME", "");
        if hostname.is_empty() {
            hostname = detect_hostname(&env);
        }
        let mut os_name = get("os_name", "AGENT_OS_NAME", "");
        if os_name.is_empty() {
            os_name = std::env::consts::OS.to_string();
        }

        let mut tenant_id = get("tenant_id", "AGENT_TENANT_ID", "");
        if tenant_id.is_empty() {
            tenant_id = env("USER").unwrap_or_default();
        }
        let mut asset_id = get("asset_id", "AGENT_ASSET_ID", "");
        if asset_id.is_empty() {
            asset_id = hostname.clone();
        }
        let mut identity_id = get("identity_id", "AGENT_IDENTITY_ID", "");
        if identity_id.is_empty() {
            identity_id = detect_machine_id().unwrap_or_else(|| hostname.clone());
        }

        let config = Self {
            transport_url,
            ingestion_url,
            tenant_id,
            asset_id,
            identity_id,
            agent_version: get("agent_version", "AGENT_VERSION", env!("CARGO_PKG_VERSION")),
            hostname,
            os_name,
            trust_state: get("trust_state", "AGENT_TRUST_STATE", "bootstrap"),
            shared_key: SecretString::from(get("shared_key", "AGENT_HMAC_SHARED_KEY", "")),
            api_key: opt("api_key", "AGENT_API_KEY"),
            cert_fingerprint: get(
                "cert_fingerprint",
                "AGENT_CERT_FINGERPRINT",
                "sha256:unprovisioned",
            ),
            identity_header: get("identity_header", "AGENT_IDENTITY", "agent-unprovisioned"),
            heartbeat_interval_seconds: parse_number(
                "heartbeat_interval_seconds",
                &get("heartbeat_interval_seconds", "AGENT_HEARTBEAT_INTERVAL", "45"),
            )?,
            max_heartbeat_interval_seconds: parse_number(
                "max_heartbeat_interval_seconds",
                &get(
                    "max_heartbeat_interval_seconds",
                    "AGENT_HEARTBEAT_MAX_INTERVAL",
                    "300",
                ),
            )?,
            watchdog_timeout_seconds: parse_number(
                "watchdog_timeout_seconds",
                &get("watchdog_timeout_seconds", "AGENT_WATCHDOG_TIMEOUT", "120"),
            )?,
            patch_poll_interval_seconds: parse_number(
                "patch_poll_interval_seconds",
                &get("patch_poll_interval_seconds", "AGENT_PATCH_POLL_INTERVAL", "60"),
            )?,
            expected_binary_hash: get("expected_binary_hash", "AGENT_EXPECTED_SHA256", ""),
            uplink_queue_dir: PathBuf::from(get(
                "uplink_queue_dir",
                "UPLINK_QUEUE_DIR",
                "uplink_queue",
            )),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check startup invariants: canonical identifiers must be non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingIdentifiers`] on violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tenant_id.is_empty() || self.asset_id.is_empty() || self.identity_id.is_empty() {
            return Err(ConfigError::MissingIdentifiers);
        }
        Ok(())
    }

    /// Whether a shared key is available for signing.
    #[must_use]
    pub fn has_shared_key(&self) -> bool {
        !self.shared_key.expose_secret().is_empty()
    }
}

/// Parse an integer option, mapping failures to [`ConfigError`].
fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    value: &str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

/// Resolve the INI path: `AGENT_CONFIG_PATH` override, else
/// `<exe-dir>/config/agent_config.ini`, else the working directory.
fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("AGENT_CONFIG_PATH") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .map_or_else(
            || PathBuf::from("agent_config.ini"),
            |dir| dir.join("config").join("agent_config.ini"),
        )
}

/// Parse the `[agent]` section of an INI document into a key-value map.
///
/// `#` starts a comment; surrounding whitespace and double quotes around
/// values are stripped. Keys outside the `[agent]` section are ignored.
#[must_use]
pub fn parse_agent_ini(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut in_agent_section = false;

    for raw_line in content.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            in_agent_section = line == "[agent]";
            continue;
        }
        if !in_agent_section {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }

    map
}

fn detect_hostname(env: &impl Fn(&str) -> Option<String>) -> String {
    if let Ok(content) = std::fs::read_to_string("/etc/hostname") {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    env("HOSTNAME").unwrap_or_else(|| "localhost".to_string())
}

fn detect_machine_id() -> Option<String> {
    std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn base_ini() -> HashMap<String, String> {
        parse_agent_ini(
            r#"
[agent]
tenant_id = "tenant-1"
asset_id = asset-1
identity_id = identity-1
shared_key = "super-secret"
"#,
        )
    }

    #[test]
    fn test_ini_section_scoping() {
        let map = parse_agent_ini(
            "[transport]\nurl = elsewhere\n[agent]\ntenant_id = t1 # inline comment\n",
        );
        assert_eq!(map.get("tenant_id").map(String::as_str), Some("t1"));
        assert!(!map.contains_key("url"));
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_sources(&base_ini(), no_env).unwrap();
        assert_eq!(config.transport_url, "https://localhost:8081");
        assert_eq!(config.ingestion_url, config.transport_url);
        assert_eq!(config.heartbeat_interval_seconds, 45);
        assert_eq!(config.max_heartbeat_interval_seconds, 300);
        assert_eq!(config.watchdog_timeout_seconds, 120);
        assert_eq!(config.uplink_queue_dir, PathBuf::from("uplink_queue"));
        assert_eq!(config.trust_state, "bootstrap");
    }

    #[test]
    fn test_env_overrides_ini() {
        let env = |key: &str| match key {
            "AGENT_HEARTBEAT_INTERVAL" => Some("90".to_string()),
            "AGENT_TRANSPORT_URL" => Some("https://cp.example:8443".to_string()),
            _ => None,
        };
        let mut ini = base_ini();
        ini.insert("heartbeat_interval_seconds".to_string(), "50".to_string());
        ini.insert(
            "transport_url".to_string(),
            "https://ini.example:9000".to_string(),
        );
        let config = Config::from_sources(&ini, env).unwrap();
        assert_eq!(config.heartbeat_interval_seconds, 90);
        assert_eq!(config.transport_url, "https://cp.example:8443");
    }

    #[test]
    fn test_env_wins_over_ini_when_both_set() {
        let env = |key: &str| {
            (key == "AGENT_TENANT_ID").then(|| "env-tenant".to_string())
        };
        let config = Config::from_sources(&base_ini(), env).unwrap();
        assert_eq!(config.tenant_id, "env-tenant");
    }

    #[test]
    fn test_missing_identifiers_rejected() {
        let mut ini = base_ini();
        ini.remove("tenant_id");
        // No USER in the environment either, so detection comes up empty.
        let result = Config::from_sources(&ini, no_env);
        assert!(matches!(result, Err(ConfigError::MissingIdentifiers)));
    }

    #[test]
    fn test_malformed_number_rejected() {
        let mut ini = base_ini();
        ini.insert(
            "watchdog_timeout_seconds".to_string(),
            "two minutes".to_string(),
        );
        let result = Config::from_sources(&ini, no_env);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                key: "watchdog_timeout_seconds",
                ..
            })
        ));
    }

    #[test]
    fn test_shared_key_presence() {
        let config = Config::from_sources(&base_ini(), no_env).unwrap();
        assert!(config.has_shared_key());

        let mut ini = base_ini();
        ini.insert("shared_key".to_string(), String::new());
        let config = Config::from_sources(&ini, no_env).unwrap();
        assert!(!config.has_shared_key());
    }
}
