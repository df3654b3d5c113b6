use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// Default Redis port used when an endpoint omits one
pub const DEFAULT_PORT: u16 = 6379;

/// Upper bound applied to async request lifetimes
pub const MAX_ASYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server endpoints, `host:port` or `host` (port 6379)
    pub endpoints: Vec<String>,

    /// Maximum number of connections handed out at the same time
    pub max_connections: usize,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Socket write timeout in milliseconds
    pub send_timeout_ms: u64,

    /// Socket read timeout in milliseconds
    pub receive_timeout_ms: u64,

    /// How long `acquire` may wait for a free slot, in milliseconds
    pub wait_timeout_ms: u64,

    /// Idle connections older than this are purged, in milliseconds
    pub idle_timeout_ms: u64,

    /// Interval of the shared idle purge timer, in milliseconds
    pub idle_purge_interval_ms: u64,

    /// Register pools and channels with the heartbeat monitor
    pub heartbeat_enabled: bool,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Timeout of a single heartbeat probe, in milliseconds
    pub heartbeat_probe_timeout_ms: u64,

    /// Let blocking `execute` fall back to the overflow queue when no
    /// connection is free, and give queued async requests `async_timeout_ms`
    /// instead of `wait_timeout_ms` to finish
    pub async_completion: bool,

    /// Lifetime of a queued request in milliseconds (capped at 60s)
    pub async_timeout_ms: u64,

    /// Issue ROLE after connecting to learn master/slave
    pub resolve_roles: bool,

    /// Reconnect a faulted pub/sub channel and resend its confirmed subscriptions
    pub pubsub_reconnect: bool,

    /// Optional client name sent with CLIENT SETNAME
    pub client_name: Option<String>,

    /// Password for AUTH
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Log level used by the command-line front end
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: vec![format!("127.0.0.1:{}", DEFAULT_PORT)],
            max_connections: 16,
            connect_timeout_ms: 5_000,
            send_timeout_ms: 5_000,
            receive_timeout_ms: 5_000,
            wait_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            idle_purge_interval_ms: 1_000,
            heartbeat_enabled: true,
            heartbeat_interval_ms: 5_000,
            heartbeat_probe_timeout_ms: 500,
            async_completion: false,
            async_timeout_ms: 10_000,
            resolve_roles: true,
            pubsub_reconnect: false,
            client_name: None,
            password: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Config with a single endpoint and defaults for everything else
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use feox_client::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("client.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.password.is_none() {
            if let Ok(password) = std::env::var("FEOX_CLIENT_PASSWORD") {
                config.password = Some(password);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("at least one endpoint is required");
        }

        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be > 0");
        }

        if self.connect_timeout_ms == 0 || self.receive_timeout_ms == 0 {
            anyhow::bail!("connect and receive timeouts must be > 0");
        }

        if self.heartbeat_enabled && self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be > 0 when heartbeat is enabled");
        }

        for endpoint in &self.endpoints {
            split_endpoint(endpoint)?;
        }

        Ok(())
    }

    /// Resolve every configured endpoint to a socket address
    pub fn resolve_endpoints(&self) -> anyhow::Result<Vec<SocketAddr>> {
        let mut addrs = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            let (host, port) = split_endpoint(endpoint)?;
            let addr = (host, port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| anyhow::anyhow!("endpoint '{}' did not resolve", endpoint))?;
            addrs.push(addr);
        }
        Ok(addrs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        non_zero(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_purge_interval(&self) -> Duration {
        Duration::from_millis(self.idle_purge_interval_ms.max(10))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_probe_timeout_ms.max(1))
    }

    /// Async request lifetime, never longer than [`MAX_ASYNC_TIMEOUT`]
    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms).min(MAX_ASYNC_TIMEOUT)
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

/// Split `host:port` into its parts. IPv6 literals must be bracketed.
fn split_endpoint(endpoint: &str) -> anyhow::Result<(&str, u16)> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        anyhow::bail!("empty endpoint");
    }

    if let Some(rest) = endpoint.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| anyhow::anyhow!("unterminated IPv6 literal in '{}'", endpoint))?;
        let host = &rest[..close];
        let port = match rest[close + 1..].strip_prefix(':') {
            Some(port) => port.parse()?,
            None => DEFAULT_PORT,
        };
        return Ok((host, port));
    }

    match endpoint.rsplit_once(':') {
        Some((host, port)) => Ok((host, port.parse()?)),
        None => Ok((endpoint, DEFAULT_PORT)),
    }
}
