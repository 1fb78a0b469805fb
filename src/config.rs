use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorFactory, ThreadFactory};
use crate::handler::{ExceptionHandler, LoggingExceptionHandler};
use crate::transport::Connector;

/// Default plain-text broker port.
pub const DEFAULT_PORT: u16 = 5672;
/// Default TLS broker port.
pub const DEFAULT_TLS_PORT: u16 = 5671;
/// Default host used when no host is configured.
pub const DEFAULT_HOST: &str = "localhost";
/// Default connection timeout.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
/// Default pause before an automatic recovery pass.
pub const DEFAULT_NETWORK_RECOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// A broker address: host plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host` or `host:port`, filling in `default_port` when absent.
    ///
    /// Bracketed IPv6 literals (`[::1]:5672`) are accepted.
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::Configuration("empty host name".into()));
        }
        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::Configuration(format!("malformed host '{input}'")))?;
            (host, tail.strip_prefix(':'))
        } else if input.matches(':').count() == 1 {
            let (host, port) = input.split_once(':').unwrap_or((input, ""));
            (host, Some(port))
        } else {
            (input, None)
        };
        if host.is_empty() {
            return Err(Error::Configuration(format!("malformed host '{input}'")));
        }
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| Error::Configuration(format!("invalid port in '{input}'")))?,
            None => default_port,
        };
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Username and password presented to the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("guest", "guest")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where consumer handlers run.
#[derive(Clone, Default)]
pub enum ExecutorSource {
    /// tokio's blocking pool, or a default-sized `ThreadPool` when a thread
    /// factory is configured.
    #[default]
    Default,
    /// An externally owned executor, never shut down by the session.
    Shared(Arc<dyn Executor>),
    /// Invoked once per connect and once per successful recovery.
    Factory(ExecutorFactory),
    /// A fixed-size `ThreadPool` built per connect/recovery cycle.
    ThreadPool(usize),
}

impl fmt::Debug for ExecutorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorSource::Default => f.write_str("Default"),
            ExecutorSource::Shared(_) => f.write_str("Shared(..)"),
            ExecutorSource::Factory(_) => f.write_str("Factory(..)"),
            ExecutorSource::ThreadPool(n) => write!(f, "ThreadPool({n})"),
        }
    }
}

/// Session configuration.
///
/// Built by value, then handed to `Session::connect`, which validates it once
/// and keeps it read-only for the lifetime of the session.
///
/// ```ignore
/// let config = Config::new()
///     .hosts(["rabbit-1", "rabbit-2:5673"])
///     .username("app")
///     .password("secret")
///     .requested_heartbeat(10)
///     .connection_timeout(3)
///     .connector(broker);
/// ```
#[derive(Clone)]
pub struct Config {
    /// Ordered failover list; entries may carry their own `:port`.
    pub hosts: Vec<String>,
    /// Port for hosts without one. `None` picks 5672, or 5671 with TLS.
    pub port: Option<u16>,
    pub credentials: Credentials,
    pub vhost: String,
    /// Requested heartbeat in seconds; `0` disables heartbeats.
    pub requested_heartbeat: u64,
    pub connection_timeout: Duration,
    pub tls: bool,
    pub executor: ExecutorSource,
    pub thread_factory: Option<Arc<dyn ThreadFactory>>,
    pub exception_handler: Arc<dyn ExceptionHandler>,
    /// Recover automatically when the link is lost.
    pub automatic_recovery: bool,
    /// Replay declared topology during recovery.
    pub topology_recovery: bool,
    pub network_recovery_interval: Duration,
    /// Passes over the host list made by a single recovery cycle.
    pub recovery_attempts: usize,
    pub connector: Option<Arc<dyn Connector>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: vec![DEFAULT_HOST.to_string()],
            port: None,
            credentials: Credentials::default(),
            vhost: "/".to_string(),
            requested_heartbeat: 0,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            tls: false,
            executor: ExecutorSource::Default,
            thread_factory: None,
            exception_handler: Arc::new(LoggingExceptionHandler),
            automatic_recovery: true,
            topology_recovery: true,
            network_recovery_interval: DEFAULT_NETWORK_RECOVERY_INTERVAL,
            recovery_attempts: 3,
            connector: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from an `amqp://` or `amqps://` URI.
    ///
    /// Recognized query parameters: `heartbeat` and `connection_timeout`, both
    /// in seconds.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url =
            Url::parse(uri).map_err(|e| Error::Configuration(format!("invalid uri: {e}")))?;
        let mut config = Config::new();
        match url.scheme() {
            "amqp" => {}
            "amqps" => config.tls = true,
            other => {
                return Err(Error::Configuration(format!(
                    "unsupported uri scheme '{other}'"
                )));
            }
        }
        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            config.hosts = vec![host.trim_matches(|c| c == '[' || c == ']').to_string()];
        }
        config.port = url.port();
        if !url.username().is_empty() {
            config.credentials.username = decode_component("username", url.username())?;
        }
        if let Some(password) = url.password() {
            config.credentials.password = decode_component("password", password)?;
        }
        let path = url.path().trim_start_matches('/');
        if !path.is_empty() {
            config.vhost = decode_component("vhost", path)?;
        }
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "heartbeat" => config.requested_heartbeat = parse_seconds(&key, &value)?,
                "connection_timeout" => {
                    config.connection_timeout =
                        Duration::from_secs(parse_seconds(&key, &value)?);
                }
                _ => {}
            }
        }
        Ok(config)
    }

    /// Ordered list of hosts to try, first success wins.
    pub fn hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Single-host shorthand for `hosts([host])`.
    pub fn hostname(mut self, host: impl Into<String>) -> Self {
        self.hosts = vec![host.into()];
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.credentials.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.credentials.password = password.into();
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Requested heartbeat interval in seconds; `0` disables heartbeats.
    pub fn requested_heartbeat(mut self, secs: u64) -> Self {
        self.requested_heartbeat = secs;
        self
    }

    /// Per-host connection timeout in seconds.
    pub fn connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout = Duration::from_secs(secs);
        self
    }

    /// Per-host connection timeout with sub-second precision.
    pub fn connection_timeout_duration(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Run consumer handlers on an externally owned executor.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = ExecutorSource::Shared(executor);
        self
    }

    /// Produce a fresh executor for each connect and each recovery.
    pub fn executor_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Executor> + Send + Sync + 'static,
    {
        self.executor = ExecutorSource::Factory(Arc::new(factory));
        self
    }

    /// Run consumer handlers on a fixed pool of `size` threads.
    pub fn thread_pool_size(mut self, size: usize) -> Self {
        self.executor = ExecutorSource::ThreadPool(size);
        self
    }

    pub fn thread_factory(mut self, factory: Arc<dyn ThreadFactory>) -> Self {
        self.thread_factory = Some(factory);
        self
    }

    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn automatic_recovery(mut self, enabled: bool) -> Self {
        self.automatic_recovery = enabled;
        self
    }

    pub fn topology_recovery(mut self, enabled: bool) -> Self {
        self.topology_recovery = enabled;
        self
    }

    pub fn network_recovery_interval(mut self, interval: Duration) -> Self {
        self.network_recovery_interval = interval;
        self
    }

    pub fn recovery_attempts(mut self, attempts: usize) -> Self {
        self.recovery_attempts = attempts;
        self
    }

    /// The broker transport used to open connections.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn connector_arc(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Port applied to hosts that do not name one.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        })
    }

    /// Heartbeat request as sent on the wire.
    pub(crate) fn heartbeat_secs(&self) -> u16 {
        u16::try_from(self.requested_heartbeat).unwrap_or(u16::MAX)
    }

    /// Check every option and resolve the ordered endpoint list.
    ///
    /// Runs before any network activity; `Session::connect` calls it once.
    pub fn validate(&self) -> Result<Vec<Endpoint>> {
        if self.hosts.is_empty() {
            return Err(Error::Configuration("host list is empty".into()));
        }
        if self.port == Some(0) {
            return Err(Error::Configuration("port must be non-zero".into()));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::Configuration(
                "connection timeout must be positive".into(),
            ));
        }
        if self.requested_heartbeat > u64::from(u16::MAX) {
            return Err(Error::Configuration(format!(
                "requested heartbeat of {}s exceeds {}s",
                self.requested_heartbeat,
                u16::MAX
            )));
        }
        if self.credentials.username.is_empty() {
            return Err(Error::Configuration("username must not be empty".into()));
        }
        if let ExecutorSource::ThreadPool(0) = self.executor {
            return Err(Error::Configuration(
                "thread pool size must be at least 1".into(),
            ));
        }
        if self.recovery_attempts == 0 {
            return Err(Error::Configuration(
                "recovery attempts must be at least 1".into(),
            ));
        }
        if self.connector.is_none() {
            return Err(Error::Configuration("no broker connector configured".into()));
        }
        let port = self.effective_port();
        self.hosts
            .iter()
            .map(|h| Endpoint::parse(h, port))
            .collect()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("hosts", &self.hosts)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .field("vhost", &self.vhost)
            .field("requested_heartbeat", &self.requested_heartbeat)
            .field("connection_timeout", &self.connection_timeout)
            .field("tls", &self.tls)
            .field("executor", &self.executor)
            .field("thread_factory", &self.thread_factory.is_some())
            .field("automatic_recovery", &self.automatic_recovery)
            .field("topology_recovery", &self.topology_recovery)
            .field("network_recovery_interval", &self.network_recovery_interval)
            .field("recovery_attempts", &self.recovery_attempts)
            .field("connector", &self.connector.is_some())
            .finish()
    }
}

fn parse_seconds(key: &str, value: &str) -> Result<u64> {
    let secs: i64 = value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{key} must be a number, got '{value}'")))?;
    u64::try_from(secs)
        .map_err(|_| Error::Configuration(format!("{key} must not be negative, got {secs}")))
}

/// Undo percent-encoding in a uri component.
fn decode_component(what: &str, raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| Error::Configuration(format!("{what} in uri is not valid utf-8: {e}")))
}
