use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Proxy configuration loaded from YAML.
///
/// Carries the process-level settings (listen addresses, timeouts, metrics,
/// allowlist) alongside the routing table that drives per-domain behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Addresses to listen on for plaintext HTTP (default: "0.0.0.0:80").
    #[serde(default = "default_http_listen_addrs")]
    pub listen_addrs: Vec<String>,
    /// Addresses to listen on for TLS (default: "0.0.0.0:443").
    #[serde(default = "default_https_listen_addrs")]
    pub tls_listen_addrs: Vec<String>,
    /// Filesystem directory for the ACME certificate cache.
    ///
    /// May be left unset in the file and supplied instead via the `-d` CLI
    /// flag; a value here always wins over the flag.
    #[serde(default)]
    pub tls_dir: Option<String>,
    /// Per-domain routing table.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Timeout configuration for various operations.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Prometheus metrics server configuration.
    #[serde(default)]
    pub metrics: Metrics,
    /// Optional list of allowed domains (supports wildcards like "*.example.com").
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,
    /// Skip certificate verification when dialing upstream over TLS.
    #[serde(default)]
    pub insecure_upstream_tls: bool,
}

fn default_http_listen_addrs() -> Vec<String> {
    vec!["0.0.0.0:80".to_string()]
}

fn default_https_listen_addrs() -> Vec<String> {
    vec!["0.0.0.0:443".to_string()]
}

/// A single hostname-to-upstream binding plus its rewrite rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Exact hostname to match, compared case-insensitively with any port
    /// suffix stripped.
    pub domain: String,
    /// Upstream origin, e.g. "http://127.0.0.1:8080" or "https://origin:443".
    pub target: String,
    /// HTTP-specific behavior for this route.
    #[serde(default)]
    pub http: HttpConfig,
    /// Ordered literal byte-string substitutions applied to this route's traffic.
    #[serde(default)]
    pub replaces: Vec<Replace>,
    /// When true, proxy this route as an opaque byte stream instead of
    /// parsing and rewriting HTTP.
    #[serde(default)]
    pub stream: bool,
}

/// Per-route HTTP behavior toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Answer cleartext requests with a 302 redirect to the https equivalent
    /// instead of proxying them.
    #[serde(default)]
    pub force_tls: bool,
    /// Append the client's remote address to the X-Forwarded-For header.
    #[serde(default)]
    pub header_forwarded_for: bool,
}

/// A single literal, non-overlapping byte-string substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replace {
    pub old: String,
    pub new: String,
}

/// Timeout settings for proxy operations (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish a backend connection (default: 10s).
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// Maximum time to receive a TLS ClientHello or HTTP request headers
    /// (default: 10s).
    #[serde(default = "default_client_hello_timeout")]
    pub client_hello: u64,
    /// Maximum idle time for an established tunnel (default: 300s).
    #[serde(default = "default_idle_timeout")]
    pub idle: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            client_hello: default_client_hello_timeout(),
            idle: default_idle_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_client_hello_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to bind the metrics/health HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "127.0.0.1:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use originproxy_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::parse(&contents)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use originproxy_config::Config;
    ///
    /// let yaml = r#"
    /// routes:
    ///   - domain: example.com
    ///     target: "http://127.0.0.1:8080"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.routes[0].domain, "example.com");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml_ng::from_str(contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the `-d` CLI override for the ACME cache directory. Only
    /// takes effect if the config file left `tls_dir` unset.
    pub fn with_tls_dir_override(mut self, dir: Option<String>) -> Self {
        if self.tls_dir.is_none() {
            self.tls_dir = dir;
        }
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if route.domain.is_empty() {
                return Err(ConfigError::InvalidRoute("empty domain".to_string()));
            }
            let key = route.domain.to_ascii_lowercase();
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateDomain(route.domain.clone()));
            }
            if url::Url::parse(&route.target).is_err() {
                return Err(ConfigError::InvalidRoute(format!(
                    "route {:?} has an unparseable target {:?}",
                    route.domain, route.target
                )));
            }
        }
        Ok(())
    }
}

/// Configuration load or validation failures. Always fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    Read(std::io::Error),
    Parse(serde_yaml_ng::Error),
    InvalidRoute(String),
    DuplicateDomain(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "failed to read config file: {e}"),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {e}"),
            ConfigError::InvalidRoute(msg) => write!(f, "invalid route: {msg}"),
            ConfigError::DuplicateDomain(domain) => {
                write!(f, "duplicate route domain: {domain}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Checks if a hostname matches an allowlist pattern.
///
/// Supports wildcard patterns for flexible domain matching:
/// - Exact match: `"example.com"` matches only `"example.com"`
/// - Subdomain wildcard: `"*.example.com"` matches `"api.example.com"`,
///   `"www.example.com"`, and `"example.com"` itself
/// - Suffix wildcard: `"*api.com"` matches `"api.com"`, `"testapi.com"`, etc.
/// - Bare `"*"` matches everything.
///
/// # Examples
///
/// ```
/// use originproxy_config::matches_allowlist_pattern;
///
/// assert!(matches_allowlist_pattern("example.com", "example.com"));
/// assert!(matches_allowlist_pattern("api.example.com", "*.example.com"));
/// assert!(matches_allowlist_pattern("myapi.com", "*api.com"));
/// ```
pub fn matches_allowlist_pattern(hostname: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == hostname {
        return true;
    }

    if let Some(domain) = pattern.strip_prefix("*.") {
        hostname.ends_with(&format!(".{domain}")) || hostname == domain
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        hostname.ends_with(suffix)
    } else {
        false
    }
}
