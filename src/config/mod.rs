use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub mod defaults;
pub mod duration_serde;

use crate::errors::{AppError, AppResult};
use crate::rules::balancer::LbPolicy;
use crate::tls::TlsMode;
use defaults::*;

/// Top-level configuration record consumed by the core.
///
/// Populated by the external driver from a TOML file, `REPROXY_`-prefixed
/// environment variables and CLI overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub headers: HeadersConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub plugin: PluginConfig,
    #[serde(default)]
    pub healthcheck: HealthCheckConfig,
    #[serde(default)]
    pub lb: LbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub signature: SignatureConfig,
    #[serde(default)]
    pub error_pages: ErrorPagesConfig,
    /// Transparent gzip compression of responses
    #[serde(default)]
    pub gzip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Plain-HTTP listen port; defaults depend on the container indicator
    pub http_port: Option<u16>,
    /// HTTPS listen port; defaults depend on the container indicator
    pub https_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,
    /// PEM certificate chain, `static` mode
    pub cert_path: Option<PathBuf>,
    /// PEM private key, `static` mode
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub acme: AcmeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Domains to obtain a certificate for; the first entry is the CN
    #[serde(default)]
    pub fqdns: Vec<String>,
    /// Contact email for the ACME account
    pub email: Option<String>,
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: PathBuf,
    /// Alternative directory URL, mostly for test endpoints
    pub directory_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default, rename = "static")]
    pub static_rules: StaticProviderConfig,
    #[serde(default)]
    pub file: FileProviderConfig,
    #[serde(default)]
    pub docker: DockerProviderConfig,
    #[serde(default)]
    pub consul: ConsulProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StaticProviderConfig {
    /// Rules of the form `server,src-pattern,dst-template[,ping-url]`
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_file_path")]
    pub path: PathBuf,
    /// How often the file is polled for changes
    #[serde(default = "default_file_check_interval", with = "duration_serde::duration")]
    pub check_interval: Duration,
    /// Settle delay between noticing a change and re-reading the file
    #[serde(default = "default_file_delay", with = "duration_serde::duration")]
    pub delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_docker_endpoint")]
    pub endpoint: String,
    /// Preferred container network when a container is attached to several
    pub network: Option<String>,
    /// Synthesize a route for every non-excluded container without labels
    #[serde(default)]
    pub auto_api: bool,
    #[serde(default = "default_provider_refresh", with = "duration_serde::duration")]
    pub refresh_interval: Duration,
    /// Container names never exposed through auto-API
    #[serde(default)]
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_consul_address")]
    pub address: String,
    #[serde(default = "default_provider_refresh", with = "duration_serde::duration")]
    pub refresh_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Upstream dial timeout
    #[serde(default = "default_dial_timeout", with = "duration_serde::duration")]
    pub dial: Duration,
    /// Upstream read timeout (response headers and body chunks)
    #[serde(default = "default_read_timeout", with = "duration_serde::duration")]
    pub read: Duration,
    /// Idle time before a pooled upstream connection is dropped
    #[serde(default = "default_idle_timeout", with = "duration_serde::duration")]
    pub idle: Duration,
    /// TCP keep-alive interval for upstream connections
    #[serde(default = "default_keep_alive", with = "duration_serde::duration")]
    pub keep_alive: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Sustained requests per second; 0 disables throttling
    #[serde(default)]
    pub rate: u32,
    /// Burst allowance; 0 means "same as rate"
    #[serde(default)]
    pub burst: u32,
    /// Status code returned on breach
    #[serde(default = "default_throttle_status")]
    pub status_code: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeadersConfig {
    /// `Name:Value` pairs appended to every upstream request
    #[serde(default)]
    pub proxy: Vec<String>,
    /// Incoming header names stripped before downstream handlers see them
    #[serde(default)]
    pub drop: Vec<String>,
    /// Global default for rules that do not pin the keep-host behavior
    #[serde(default)]
    pub keep_host: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum accepted request body, e.g. `64KB`; `0` disables the check
    #[serde(default = "default_max_body_size")]
    pub max_body_size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// Root directory served when no rule matches; unset disables the fallback
    pub location: Option<PathBuf>,
    #[serde(default = "default_assets_web_root")]
    pub web_root: String,
    /// Serve `index.html` for missing files (single-page applications)
    #[serde(default)]
    pub spa: bool,
    /// Cache-Control entries, `duration` or `mime/type:duration`
    #[serde(default)]
    pub cache: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// `user:bcrypt-hash` entries gating the whole proxy; empty disables auth
    #[serde(default)]
    pub htpasswd: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_plugin_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval", with = "duration_serde::duration")]
    pub interval: Duration,
    #[serde(default = "default_health_timeout", with = "duration_serde::duration")]
    pub timeout: Duration,
    /// Upper bound on concurrent probes per sweep
    #[serde(default = "default_health_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LbConfig {
    #[serde(default)]
    pub policy: LbPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Emit one structured access-log line per completed request
    #[serde(default)]
    pub access: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    /// Label request metrics with the matched source pattern instead of the
    /// raw path, keeping the route-label cardinality bounded
    #[serde(default)]
    pub low_cardinality: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignatureConfig {
    /// Stamp identifying headers (App-Name, App-Version, Org, Server)
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub organization: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorPagesConfig {
    /// Render upstream failures through the HTML template below
    #[serde(default)]
    pub enabled: bool,
    /// Template file with `{{status}}` and `{{message}}` placeholders
    pub template: Option<PathBuf>,
}

// Section defaults

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_acme_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_ACME_CACHE_DIR)
}

fn default_file_path() -> PathBuf {
    PathBuf::from(DEFAULT_FILE_PATH)
}

fn default_file_check_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_file_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_docker_endpoint() -> String {
    DEFAULT_DOCKER_ENDPOINT.to_string()
}

fn default_consul_address() -> String {
    DEFAULT_CONSUL_ADDRESS.to_string()
}

fn default_provider_refresh() -> Duration {
    Duration::from_secs(10)
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_throttle_status() -> u16 {
    429
}

fn default_max_body_size() -> String {
    "0".to_string()
}

fn default_assets_web_root() -> String {
    "/".to_string()
}

fn default_plugin_listen() -> String {
    DEFAULT_PLUGIN_LISTEN.to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_concurrency() -> usize {
    8
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: None,
            https_port: None,
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            fqdns: Vec::new(),
            email: None,
            cache_dir: default_acme_cache_dir(),
            directory_url: None,
        }
    }
}

impl Default for FileProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_file_path(),
            check_interval: default_file_check_interval(),
            delay: default_file_delay(),
        }
    }
}

impl Default for DockerProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_docker_endpoint(),
            network: None,
            auto_api: false,
            refresh_interval: default_provider_refresh(),
            excluded: Vec::new(),
        }
    }
}

impl Default for ConsulProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_consul_address(),
            refresh_interval: default_provider_refresh(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            dial: default_dial_timeout(),
            read: default_read_timeout(),
            idle: default_idle_timeout(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rate: 0,
            burst: 0,
            status_code: default_throttle_status(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            location: None,
            web_root: default_assets_web_root(),
            spa: false,
            cache: Vec::new(),
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_plugin_listen(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            concurrency: default_health_concurrency(),
        }
    }
}

/// Whether the process runs inside a container, per the indicator variable.
/// Containerized deployments default to the unprivileged 8080/8443 ports.
pub fn in_container() -> bool {
    std::env::var(IN_CONTAINER_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl Config {
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if !std::path::Path::new(config_file).exists() {
            tracing::warn!(
                "Config file '{}' not found, using default configuration values",
                config_file
            );

            let default_config = Self::default();
            let config: Config = Figment::new()
                .merge(figment::providers::Serialized::defaults(default_config))
                .merge(Env::prefixed("REPROXY_").split("__"))
                .extract()?;

            return Ok(config);
        }

        let config: Config = Figment::new()
            .merge(Toml::file(config_file))
            .merge(Env::prefixed("REPROXY_").split("__"))
            .extract()?;

        Ok(config)
    }

    /// Resolved plain-HTTP listen address
    pub fn http_addr(&self) -> AppResult<SocketAddr> {
        let port = self.listen.http_port.unwrap_or(if in_container() {
            DEFAULT_CONTAINER_HTTP_PORT
        } else {
            DEFAULT_HTTP_PORT
        });
        self.listen_addr(port)
    }

    /// Resolved HTTPS listen address
    pub fn https_addr(&self) -> AppResult<SocketAddr> {
        let port = self.listen.https_port.unwrap_or(if in_container() {
            DEFAULT_CONTAINER_HTTPS_PORT
        } else {
            DEFAULT_HTTPS_PORT
        });
        self.listen_addr(port)
    }

    fn listen_addr(&self, port: u16) -> AppResult<SocketAddr> {
        format!("{}:{}", self.listen.host, port)
            .parse()
            .map_err(|e| AppError::configuration(format!("invalid listen address: {e}")))
    }

    /// Maximum accepted request body in bytes; 0 disables the limit
    pub fn max_body_bytes(&self) -> AppResult<u64> {
        crate::utils::parse_size(&self.limits.max_body_size).map_err(AppError::configuration)
    }

    /// Sanity-check the configuration before the core starts.
    ///
    /// Failing here is fatal: the external driver exits with code 2.
    pub fn validate(&self) -> AppResult<()> {
        match self.tls.mode {
            TlsMode::None => {}
            TlsMode::Static => {
                if self.tls.cert_path.is_none() || self.tls.key_path.is_none() {
                    return Err(AppError::configuration(
                        "tls mode 'static' requires cert_path and key_path",
                    ));
                }
            }
            TlsMode::Auto => {
                if self.tls.acme.fqdns.is_empty() {
                    return Err(AppError::configuration(
                        "tls mode 'auto' requires at least one acme fqdn",
                    ));
                }
            }
        }

        for spec in &self.providers.static_rules.rules {
            crate::providers::static_rules::parse_rule(spec)
                .map_err(|e| AppError::configuration(format!("static rule '{spec}': {e}")))?;
        }

        if !(100..=599).contains(&self.throttle.status_code) {
            return Err(AppError::configuration(format!(
                "throttle status code {} out of range",
                self.throttle.status_code
            )));
        }

        self.max_body_bytes()?;

        for entry in &self.auth.htpasswd {
            if !entry.contains(':') {
                return Err(AppError::configuration(format!(
                    "htpasswd entry '{entry}' is not of the form user:bcrypt-hash"
                )));
            }
        }

        if self.plugin.enabled {
            self.plugin
                .listen
                .parse::<SocketAddr>()
                .map_err(|e| AppError::configuration(format!("plugin listen address: {e}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.throttle.status_code, 429);
        assert_eq!(config.healthcheck.interval, Duration::from_secs(300));
    }

    #[test]
    fn rejects_static_tls_without_material() {
        let mut config = Config::default();
        config.tls.mode = TlsMode::Static;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_static_rule() {
        let mut config = Config::default();
        config.providers.static_rules.rules = vec!["only-two,fields".to_string()];
        assert!(config.validate().is_err());

        config.providers.static_rules.rules =
            vec!["*,/api/(.*),http://127.0.0.1:8080/$1".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_max_body_size() {
        let mut config = Config::default();
        assert_eq!(config.max_body_bytes().unwrap(), 0);
        config.limits.max_body_size = "64KB".to_string();
        assert_eq!(config.max_body_bytes().unwrap(), 64 * 1024);
    }
}
