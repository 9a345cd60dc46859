use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"gateway"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// Directory holding the KV store (schedules, audit log).
    /// Relative paths resolve against the config directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Macro catalog (`macros` + `buttons`) in YAML.
    /// Relative paths resolve against the config directory.
    #[serde(default = "default_macros_path")]
    pub macros_path: String,
    /// Schedule runner settings.
    #[serde(default)]
    pub scheduler: SchedulerCfg,
    /// Macro executor settings.
    #[serde(default)]
    pub executor: ExecutorCfg,
    /// HTTP/HTTPS control plane.
    #[serde(default)]
    pub web: WebCfg,
    /// Device back end endpoints.
    #[serde(default)]
    pub devices: DevicesCfg,
    /// Canned state for `--mock` runs.
    #[serde(default)]
    pub mock: MockCfg,
}

/// Schedule runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerCfg {
    /// Seconds between schedule evaluations.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

/// Macro executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorCfg {
    /// Pause between `retry:N` attempts (ms).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Listener addresses and TLS material for the web module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebCfg {
    /// Plain HTTP listener, e.g. `"0.0.0.0:8080"`.
    #[serde(default = "default_http_addr")]
    pub http_addr: Option<String>,
    /// HTTPS listener (needs cert + key).
    #[serde(default)]
    pub https_addr: Option<String>,
    /// PEM certificate path.
    #[serde(default)]
    pub tls_cert_pem: Option<String>,
    /// PEM private key path.
    #[serde(default)]
    pub tls_key_pem: Option<String>,
}

/// Where each device family lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesCfg {
    /// Video-matrix middleware base URL.
    #[serde(default)]
    pub matrix_url: Option<String>,
    /// Audio-mixer middleware base URL.
    #[serde(default)]
    pub mixer_url: Option<String>,
    /// Streaming-encoder middleware base URL.
    #[serde(default)]
    pub streaming_url: Option<String>,
    /// Projector key -> host/IP.
    #[serde(default)]
    pub projectors: BTreeMap<String, String>,
    /// Camera key -> host/IP.
    #[serde(default)]
    pub cameras: BTreeMap<String, String>,
    /// Home-automation hub.
    #[serde(default)]
    pub home_automation: Option<HomeAutomationCfg>,
    /// Per-call timeout for middleware, projectors and cameras (ms).
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
}

/// Home-automation hub endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAutomationCfg {
    /// Base URL, e.g. `"http://hub.local:8123"`.
    pub url: String,
    /// Long-lived bearer token.
    pub token: String,
    /// Per-call timeout (ms).
    #[serde(default = "default_ha_timeout_ms")]
    pub timeout_ms: u64,
}

/// Canned device state used by the mock back end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockCfg {
    /// Entity id -> reported state.
    #[serde(default)]
    pub ha_states: BTreeMap<String, String>,
}

fn default_data_dir() -> String { "data".to_string() }
fn default_macros_path() -> String { "macros.yaml".to_string() }
fn default_tick_secs() -> u64 { 30 }
fn default_retry_backoff_ms() -> u64 { 1_000 }
fn default_http_addr() -> Option<String> { Some("0.0.0.0:8080".to_string()) }
fn default_device_timeout_ms() -> u64 { 3_000 }
fn default_ha_timeout_ms() -> u64 { 10_000 }

impl Default for SchedulerCfg {
    fn default() -> Self { Self { tick_secs: default_tick_secs() } }
}

impl Default for ExecutorCfg {
    fn default() -> Self { Self { retry_backoff_ms: default_retry_backoff_ms() } }
}

impl Default for WebCfg {
    fn default() -> Self {
        Self { http_addr: default_http_addr(), https_addr: None, tls_cert_pem: None, tls_key_pem: None }
    }
}

impl Default for DevicesCfg {
    fn default() -> Self {
        Self {
            matrix_url: None,
            mixer_url: None,
            streaming_url: None,
            projectors: BTreeMap::new(),
            cameras: BTreeMap::new(),
            home_automation: None,
            timeout_ms: default_device_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: default_data_dir(),
            macros_path: default_macros_path(),
            scheduler: SchedulerCfg::default(),
            executor: ExecutorCfg::default(),
            web: WebCfg::default(),
            devices: DevicesCfg::default(),
            mock: MockCfg::default(),
        }
    }
}

impl Config {
    /// Resolve a configured path against `base` unless it is absolute.
    pub fn resolve(base: &Path, p: &str) -> PathBuf {
        let path = Path::new(p);
        if path.is_absolute() { path.to_path_buf() } else { base.join(path) }
    }
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
    let dir = pd.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<(Config, PathBuf)> {
    let dir = config_dir(app)?;
    let cfg = load_or_init_at(&dir.join("config.toml"))?;
    Ok((cfg, dir))
}

/// Load the config file at `path`, writing defaults there if it does not exist.
pub fn load_or_init_at(path: &Path) -> Result<Config> {
    if path.exists() {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    } else {
        let cfg = Config::default();
        save_config(path, &cfg)?;
        Ok(cfg)
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            log_level = "debug"

            [devices.projectors]
            left = "10.0.0.21"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler.tick_secs, 30);
        assert_eq!(cfg.executor.retry_backoff_ms, 1_000);
        assert_eq!(cfg.macros_path, "macros.yaml");
        assert_eq!(cfg.devices.projectors.get("left").map(String::as_str), Some("10.0.0.21"));
    }

    #[test]
    fn relative_paths_resolve_against_base() {
        let base = Path::new("/etc/gateway");
        assert_eq!(Config::resolve(base, "macros.yaml"), PathBuf::from("/etc/gateway/macros.yaml"));
        assert_eq!(Config::resolve(base, "/srv/m.yaml"), PathBuf::from("/srv/m.yaml"));
    }
}
