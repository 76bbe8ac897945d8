//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env > `kiro-switcher.toml`.
//! Every section is optional; store paths default to locations under `$HOME`
//! and are resolved once at load time.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiro_auth::{REFRESH_BEFORE_EXPIRY_SECS, TOKEN_URL_TEMPLATE, USAGE_LIMITS_URL_TEMPLATE};

const DEFAULT_CONFIG_FILE: &str = "kiro-switcher.toml";
const DEFAULT_DATA_DIR: &str = ".kiro-manager-wb";
const DEFAULT_CURRENT_TOKEN: &str = ".aws/sso/cache/kiro-auth-token.json";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Credential store and cache locations. Unset paths fall back to defaults
/// under `data_dir` (itself `~/.kiro-manager-wb` by default).
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    pub data_dir: Option<PathBuf>,
    pub tokens_dir: Option<PathBuf>,
    pub current_token_path: Option<PathBuf>,
    pub usage_cache_path: Option<PathBuf>,
    pub usage_stats_path: Option<PathBuf>,
}

/// Fully resolved store paths
#[derive(Debug, Clone, PartialEq)]
pub struct StorePaths {
    pub tokens_dir: PathBuf,
    pub current_token_path: PathBuf,
    pub usage_cache_path: PathBuf,
    pub usage_stats_path: PathBuf,
}

/// Identity provider endpoints. Templates may contain `{region}`.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_usage_url")]
    pub usage_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_threshold")]
    pub threshold_secs: u64,
    /// Pause between accounts in batch refresh and health checks
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_debounce")]
    pub debounce_secs: u64,
    /// Fail over on its own when the active account is banned or expired
    #[serde(default = "default_true")]
    pub auto: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

/// Admin HTTP API settings
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_token_url() -> String {
    TOKEN_URL_TEMPLATE.to_string()
}

fn default_usage_url() -> String {
    USAGE_LIMITS_URL_TEMPLATE.to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    60
}

fn default_threshold() -> u64 {
    REFRESH_BEFORE_EXPIRY_SECS as u64
}

fn default_batch_delay() -> u64 {
    300
}

fn default_debounce() -> u64 {
    5
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    64
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            usage_url: default_usage_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
            threshold_secs: default_threshold(),
            batch_delay_ms: default_batch_delay(),
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce(),
            auto: true,
            interval_secs: default_interval(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl FailoverConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl StoreConfig {
    /// Resolve every path, filling defaults relative to `home`.
    pub fn resolve(&self, home: Option<&Path>) -> common::Result<StorePaths> {
        let data_dir = match (&self.data_dir, home) {
            (Some(dir), _) => dir.clone(),
            (None, Some(home)) => home.join(DEFAULT_DATA_DIR),
            (None, None) => return Err(common::Error::UnresolvedPath("data_dir")),
        };
        let current_token_path = match (&self.current_token_path, home) {
            (Some(path), _) => path.clone(),
            (None, Some(home)) => home.join(DEFAULT_CURRENT_TOKEN),
            (None, None) => return Err(common::Error::UnresolvedPath("current_token_path")),
        };

        Ok(StorePaths {
            tokens_dir: self
                .tokens_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("tokens")),
            current_token_path,
            usage_cache_path: self
                .usage_cache_path
                .clone()
                .unwrap_or_else(|| data_dir.join("account-usage.json")),
            usage_stats_path: self
                .usage_stats_path
                .clone()
                .unwrap_or_else(|| data_dir.join("usage-stats.json")),
        })
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate a TOML document.
    pub fn parse(contents: &str) -> common::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        for (name, url) in [
            ("token_url", &self.provider.token_url),
            ("usage_url", &self.provider.usage_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.provider.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.refresh.interval_secs == 0 {
            return Err(common::Error::Config(
                "interval_secs must be greater than 0".into(),
            ));
        }

        if self.failover.auto && self.failover.interval_secs == 0 {
            return Err(common::Error::Config(
                "failover interval_secs must be greater than 0".into(),
            ));
        }

        if self.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Store paths resolved against `$HOME`.
    pub fn store_paths(&self) -> common::Result<StorePaths> {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        self.store.resolve(home.as_deref())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[store]
data_dir = "/srv/kiro"
current_token_path = "/srv/sso/kiro-auth-token.json"

[provider]
token_url = "http://127.0.0.1:4000/{region}/token"
timeout_secs = 3

[refresh]
interval_secs = 30

[failover]
debounce_secs = 2
auto = false
interval_secs = 15

[admin]
listen_addr = "127.0.0.1:9191"
max_connections = 8
"#
    }

    #[test]
    fn load_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, valid_toml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.provider.token_url, "http://127.0.0.1:4000/{region}/token");
        assert_eq!(config.provider.usage_url, USAGE_LIMITS_URL_TEMPLATE);
        assert_eq!(config.provider.timeout(), Duration::from_secs(3));
        assert_eq!(config.refresh.interval(), Duration::from_secs(30));
        assert_eq!(config.refresh.threshold(), Duration::from_secs(600));
        assert!(config.refresh.enabled);
        assert_eq!(config.failover.debounce(), Duration::from_secs(2));
        assert!(!config.failover.auto);
        assert_eq!(config.failover.interval(), Duration::from_secs(15));
        assert_eq!(config.admin.listen_addr.port(), 9191);
        assert_eq!(config.admin.max_connections, 8);

        let paths = config.store.resolve(None).unwrap();
        assert_eq!(paths.tokens_dir, PathBuf::from("/srv/kiro/tokens"));
        assert_eq!(
            paths.usage_cache_path,
            PathBuf::from("/srv/kiro/account-usage.json")
        );
        assert_eq!(
            paths.current_token_path,
            PathBuf::from("/srv/sso/kiro-auth-token.json")
        );
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.provider.token_url, TOKEN_URL_TEMPLATE);
        assert_eq!(config.provider.timeout_secs, 10);
        assert_eq!(config.refresh.interval_secs, 60);
        assert_eq!(config.refresh.batch_delay(), Duration::from_millis(300));
        assert_eq!(config.failover.debounce_secs, 5);
        assert!(config.failover.auto);
        assert_eq!(config.failover.interval_secs, 60);
        assert_eq!(config.admin.listen_addr, default_listen_addr());
    }

    #[test]
    fn store_paths_default_under_home() {
        let config = Config::parse("").unwrap();
        let paths = config.store.resolve(Some(Path::new("/home/dev"))).unwrap();
        assert_eq!(
            paths,
            StorePaths {
                tokens_dir: PathBuf::from("/home/dev/.kiro-manager-wb/tokens"),
                current_token_path: PathBuf::from(
                    "/home/dev/.aws/sso/cache/kiro-auth-token.json"
                ),
                usage_cache_path: PathBuf::from("/home/dev/.kiro-manager-wb/account-usage.json"),
                usage_stats_path: PathBuf::from("/home/dev/.kiro-manager-wb/usage-stats.json"),
            }
        );
    }

    #[test]
    fn explicit_paths_override_data_dir() {
        let config = Config::parse(
            r#"
[store]
data_dir = "/data"
tokens_dir = "/elsewhere/tokens"
usage_stats_path = "/elsewhere/stats.json"
"#,
        )
        .unwrap();
        let paths = config.store.resolve(Some(Path::new("/home/dev"))).unwrap();
        assert_eq!(paths.tokens_dir, PathBuf::from("/elsewhere/tokens"));
        assert_eq!(paths.usage_stats_path, PathBuf::from("/elsewhere/stats.json"));
        assert_eq!(paths.usage_cache_path, PathBuf::from("/data/account-usage.json"));
    }

    #[test]
    fn missing_home_without_paths_is_an_error() {
        let config = Config::parse("").unwrap();
        let err = config.store.resolve(None).unwrap_err();
        assert!(matches!(err, common::Error::UnresolvedPath("data_dir")));
    }

    #[test]
    fn load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_invalid_toml() {
        assert!(Config::parse("not valid {{{{ toml").is_err());
    }

    #[test]
    fn url_without_scheme_rejected() {
        let err = Config::parse(
            r#"
[provider]
usage_url = "codewhisperer.{region}.amazonaws.com"
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("usage_url must start with http"),
            "got: {err}"
        );
    }

    #[test]
    fn zero_values_rejected() {
        for doc in [
            "[provider]\ntimeout_secs = 0",
            "[refresh]\ninterval_secs = 0",
            "[admin]\nmax_connections = 0",
            "[failover]\ninterval_secs = 0",
        ] {
            assert!(Config::parse(doc).is_err(), "{doc} must be rejected");
        }
        assert!(Config::parse("[failover]\nauto = false\ninterval_secs = 0").is_ok());
    }

    #[test]
    fn resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("kiro-switcher.toml"));
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
