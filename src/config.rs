//! Startup configuration tree (spec §3, §6; SPEC_FULL §4.7 "A1").
//!
//! Grounded in `original_source/structure/config.go` and `conf/*.go`: a YAML
//! document deserialized with `serde_yaml` into the same shape the original
//! builds from `gopkg.in/yaml.v3`, including its per-limit-block
//! `YamlValid()`/`AddressContained` checks (`is_valid`/`matches_address`
//! below) and the "first matching block wins, empty `remoteAddresses` is the
//! default" selection rule (`conf/limits.go`'s `GetLimitConnectionYaml` and
//! siblings, reproduced as `LimitsConfig::pick_*`).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Deserializes a plain integer as a millisecond count into a [`Duration`].
/// The original expresses intervals as Go `time.Duration` string literals
/// (`"250ms"`); the YAML surface here is simplified to bare milliseconds
/// since no other example in the pack parses duration strings with serde.
mod millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub log_level: u8,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenConfig {
    #[serde(default = "default_web_addr")]
    pub web: String,
    #[serde(default = "default_api_addr")]
    pub api: String,
    #[serde(default, with = "millis")]
    pub read_timeout: Duration,
    #[serde(default, with = "millis")]
    pub write_timeout: Duration,
    #[serde(default, with = "millis")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub identify: bool,
}

fn default_web_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_api_addr() -> String {
    "0.0.0.0:8081".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            web: default_web_addr(),
            api: default_api_addr(),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            identify: false,
        }
    }
}

impl ListenConfig {
    /// Unset (zero) timeouts floor to one second, matching `conf/listen.go`'s
    /// `Get*Timeout` methods.
    pub fn read_timeout(&self) -> Duration {
        floor_one_second(self.read_timeout)
    }
    pub fn write_timeout(&self) -> Duration {
        floor_one_second(self.write_timeout)
    }
    pub fn idle_timeout(&self) -> Duration {
        floor_one_second(self.idle_timeout)
    }
}

fn floor_one_second(d: Duration) -> Duration {
    if d < Duration::from_secs(1) {
        Duration::from_secs(1)
    } else {
        d
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_range: bool,
    #[serde(default)]
    pub cache_response: CacheSettings,
    #[serde(default)]
    pub download_response: DownloadSettings,
    #[serde(default)]
    pub access_limit: AccessLimitConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default = "default_backend_name")]
    pub backend: String,
    #[serde(default)]
    pub backend_settings: HashMap<String, String>,
}

fn default_backend_name() -> String {
    "filesystem".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    #[serde(default = "default_max_age")]
    pub max_age: u32,
    #[serde(default)]
    pub private_cache: bool,
    #[serde(default = "default_true")]
    pub not_modified_using_last_modified: bool,
    #[serde(default = "default_true")]
    pub not_modified_using_etags: bool,
    #[serde(default)]
    pub request_limited_cache_check: bool,
}

fn default_max_age() -> u32 {
    3600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            private_cache: false,
            not_modified_using_last_modified: true,
            not_modified_using_etags: true,
            request_limited_cache_check: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSettings {
    #[serde(default)]
    pub output_disposition: bool,
    #[serde(default)]
    pub output_filename: bool,
    #[serde(default)]
    pub set_extension_if_missing: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLimitConfig {
    #[serde(default)]
    pub purge_expired: bool,
    #[serde(default, with = "millis")]
    pub expire_time: Duration,
    #[serde(default)]
    pub access_limit: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    #[serde(default)]
    pub connection_limits: Vec<ConnectionLimitConfig>,
    #[serde(default)]
    pub request_limits: Vec<RequestLimitConfig>,
    #[serde(default)]
    pub bandwidth_limits: Vec<BandwidthLimitConfig>,
}

/// Case-insensitive membership check matching `AddressContained` in the
/// original; an empty list means "this is the default block" rather than
/// "matches nothing", so membership is tested by the caller, not here.
fn address_contained(addresses: &[String], addr: &str) -> bool {
    addresses.iter().any(|a| a.eq_ignore_ascii_case(addr))
}

/// First matching non-default block wins; otherwise the first block with an
/// empty `remote_addresses` (the default) is used; otherwise `None` (spec
/// §4.4, SPEC_FULL P8).
fn pick<'a, T>(blocks: &'a [T], addr: &str, remote_addresses: impl Fn(&T) -> &[String], valid: impl Fn(&T) -> bool) -> Option<&'a T> {
    blocks
        .iter()
        .filter(|b| valid(b))
        .find(|b| !remote_addresses(b).is_empty() && address_contained(remote_addresses(b), addr))
        .or_else(|| blocks.iter().filter(|b| valid(b)).find(|b| remote_addresses(b).is_empty()))
}

impl LimitsConfig {
    pub fn pick_connection(&self, addr: &str) -> Option<&ConnectionLimitConfig> {
        pick(&self.connection_limits, addr, |c| &c.remote_addresses, |c| c.is_valid())
    }

    pub fn pick_request(&self, addr: &str) -> Option<&RequestLimitConfig> {
        pick(&self.request_limits, addr, |c| &c.remote_addresses, |c| c.is_valid())
    }

    pub fn pick_bandwidth(&self, addr: &str) -> Option<&BandwidthLimitConfig> {
        pick(&self.bandwidth_limits, addr, |c| &c.remote_addresses, |c| c.is_valid())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLimitConfig {
    #[serde(default)]
    pub remote_addresses: Vec<String>,
    #[serde(default)]
    pub max_connections: u32,
}

impl ConnectionLimitConfig {
    pub fn is_valid(&self) -> bool {
        self.max_connections != 0
    }

    pub fn matches_address(&self, addr: &str) -> bool {
        self.remote_addresses.is_empty() || address_contained(&self.remote_addresses, addr)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLimitConfig {
    #[serde(default)]
    pub remote_addresses: Vec<String>,
    #[serde(default)]
    pub max_requests: u32,
    #[serde(default, with = "millis")]
    pub request_rate_interval: Duration,
}

impl Default for RequestLimitConfig {
    fn default() -> Self {
        Self {
            remote_addresses: Vec::new(),
            max_requests: 0,
            request_rate_interval: Duration::ZERO,
        }
    }
}

impl RequestLimitConfig {
    pub fn is_valid(&self) -> bool {
        self.max_requests != 0 && self.request_rate_interval >= Duration::from_millis(10)
    }

    pub fn matches_address(&self, addr: &str) -> bool {
        self.remote_addresses.is_empty() || address_contained(&self.remote_addresses, addr)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthLimitConfig {
    #[serde(default)]
    pub remote_addresses: Vec<String>,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default, with = "millis")]
    pub interval: Duration,
}

impl Default for BandwidthLimitConfig {
    fn default() -> Self {
        Self {
            remote_addresses: Vec::new(),
            bytes: 0,
            interval: Duration::ZERO,
        }
    }
}

impl BandwidthLimitConfig {
    pub fn is_valid(&self) -> bool {
        self.bytes != 0 && self.interval >= Duration::from_millis(1)
    }

    pub fn matches_address(&self, addr: &str) -> bool {
        self.remote_addresses.is_empty() || address_contained(&self.remote_addresses, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
logLevel: 2
listen:
  web: "0.0.0.0:9000"
zones:
  - name: assets
    domains: ["cdn.example.com"]
    backend: filesystem
    backendSettings:
      directoryPath: "/srv/assets"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.log_level, 2);
        assert_eq!(cfg.listen.web, "0.0.0.0:9000");
        assert_eq!(cfg.zones.len(), 1);
        assert_eq!(cfg.zones[0].name, "assets");
        assert_eq!(cfg.zones[0].backend_settings.get("directoryPath").unwrap(), "/srv/assets");
    }

    #[test]
    fn listen_timeouts_floor_to_one_second() {
        let listen = ListenConfig::default();
        assert_eq!(listen.read_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn limit_selection_prefers_specific_over_default() {
        let limits = LimitsConfig {
            connection_limits: vec![
                ConnectionLimitConfig { remote_addresses: vec![], max_connections: 10 },
                ConnectionLimitConfig { remote_addresses: vec!["1.2.3.4".into()], max_connections: 2 },
            ],
            ..Default::default()
        };
        let picked = limits.pick_connection("1.2.3.4").unwrap();
        assert_eq!(picked.max_connections, 2);
        let default_picked = limits.pick_connection("9.9.9.9").unwrap();
        assert_eq!(default_picked.max_connections, 10);
    }

    #[test]
    fn invalid_blocks_are_never_selected() {
        let limits = LimitsConfig {
            request_limits: vec![RequestLimitConfig {
                remote_addresses: vec![],
                max_requests: 0,
                request_rate_interval: Duration::from_secs(1),
            }],
            ..Default::default()
        };
        assert!(limits.pick_request("1.2.3.4").is_none());
    }
}
