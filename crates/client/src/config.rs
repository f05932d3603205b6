//! Connection configuration.
//!
//! Defaults are merged with caller overrides through the builder setters
//! (or struct-update syntax). A config is validated once when the manager
//! is built and never changes afterwards.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Subprotocol requested by the socket transport unless overridden.
pub const DEFAULT_SOCKET_PROTOCOL: &str = "notification-protocol";

/// Base URL used when none is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid {field} URL `{value}`: {message}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        message: String,
    },

    #[error("backoff multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("max reconnect delay {max:?} is shorter than the base delay {base:?}")]
    DelayOrder { base: Duration, max: Duration },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("invalid value `{value}` for {var}")]
    InvalidVar { var: &'static str, value: String },

    #[error("unknown transport preference `{0}` (expected auto, streaming or socket)")]
    UnknownPreference(String),
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionPolicy {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectionPolicy {
    /// Delay before reconnect attempt `attempt` (0-based):
    /// `min(base_delay * backoff_multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt may be scheduled after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.backoff_multiplier));
        }
        if self.base_delay.is_zero() {
            return Err(ConfigError::ZeroDuration("base reconnect delay"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::DelayOrder {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }
}

/// Settings for one transport kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Server root; endpoint paths are appended to it.
    pub base_url: String,
    pub reconnection: ReconnectionPolicy,
    /// Inbound silence longer than twice this marks the connection stale.
    /// The socket kind also sends its `ping` probe at this interval.
    pub heartbeat_interval: Duration,
    /// How long a connect attempt may take before it counts as failed.
    pub connection_timeout: Duration,
    /// Subprotocols requested by the socket transport.
    pub transport_protocols: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            reconnection: ReconnectionPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            transport_protocols: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Defaults for the socket kind, which requests the notification
    /// subprotocol.
    #[must_use]
    pub fn socket(base_url: impl Into<String>) -> Self {
        Self::new(base_url).transport_protocols([DEFAULT_SOCKET_PROTOCOL])
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.reconnection = policy;
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn transport_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transport_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Parsed base URL.
    pub fn url(&self) -> Result<Url, ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::InvalidUrl {
                field: "base",
                value: String::new(),
                message: "URL cannot be empty".to_string(),
            });
        }
        Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidUrl {
            field: "base",
            value: self.base_url.clone(),
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.url()?;
        self.reconnection.validate()?;
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("heartbeat interval"));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("connection timeout"));
        }
        Ok(())
    }
}

/// Which transport kind `connect` should start with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionPreference {
    /// Capability detection on every connect; prefers streaming.
    #[default]
    Auto,
    Streaming,
    Socket,
}

impl FromStr for ConnectionPreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ConnectionPreference::Auto),
            "streaming" | "sse" => Ok(ConnectionPreference::Streaming),
            "socket" | "websocket" | "ws" => Ok(ConnectionPreference::Socket),
            other => Err(ConfigError::UnknownPreference(other.to_string())),
        }
    }
}

/// Top-level manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub preferred: ConnectionPreference,
    pub fallback_enabled: bool,
    /// Wait between a failure episode and switching to the other kind.
    pub fallback_grace: Duration,
    pub streaming: ConnectionConfig,
    pub socket: ConnectionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            preferred: ConnectionPreference::Auto,
            fallback_enabled: true,
            fallback_grace: Duration::from_secs(1),
            streaming: ConnectionConfig::new(DEFAULT_BASE_URL),
            socket: ConnectionConfig::socket(DEFAULT_BASE_URL),
        }
    }
}

impl ManagerConfig {
    /// Both kinds pointed at the same server.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            streaming: ConnectionConfig::new(base_url.clone()),
            socket: ConnectionConfig::socket(base_url),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn preferred(mut self, preferred: ConnectionPreference) -> Self {
        self.preferred = preferred;
        self
    }

    #[must_use]
    pub fn fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    #[must_use]
    pub fn fallback_grace(mut self, grace: Duration) -> Self {
        self.fallback_grace = grace;
        self
    }

    #[must_use]
    pub fn streaming(mut self, config: ConnectionConfig) -> Self {
        self.streaming = config;
        self
    }

    #[must_use]
    pub fn socket(mut self, config: ConnectionConfig) -> Self {
        self.socket = config;
        self
    }

    /// Apply the same change to both transport configs.
    #[must_use]
    pub fn map_connections(mut self, f: impl Fn(ConnectionConfig) -> ConnectionConfig) -> Self {
        self.streaming = f(self.streaming);
        self.socket = f(self.socket);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.streaming.validate()?;
        self.socket.validate()?;
        if self.fallback_grace.is_zero() {
            return Err(ConfigError::ZeroDuration("fallback grace delay"));
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NOTIFLOW_BASE_URL`: server root (default: "http://localhost:8080")
    /// - `NOTIFLOW_WS_URL`: socket server root (default: the base URL)
    /// - `NOTIFLOW_TRANSPORT`: "auto" | "streaming" | "socket" (default: "auto")
    /// - `NOTIFLOW_FALLBACK`: "true" | "false" (default: "true")
    /// - `NOTIFLOW_HEARTBEAT_MS`: heartbeat interval (default: 30000)
    /// - `NOTIFLOW_TIMEOUT_MS`: connection timeout (default: 10000)
    /// - `NOTIFLOW_MAX_ATTEMPTS`: reconnect attempts per kind (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ManagerConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = lookup("NOTIFLOW_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let ws_url = lookup("NOTIFLOW_WS_URL").unwrap_or_else(|| base_url.clone());

        let mut config = Self::new(base_url).socket(ConnectionConfig::socket(ws_url));

        if let Some(value) = lookup("NOTIFLOW_TRANSPORT") {
            config.preferred = value.parse()?;
        }
        if let Some(value) = lookup("NOTIFLOW_FALLBACK") {
            config.fallback_enabled = parse_var("NOTIFLOW_FALLBACK", &value)?;
        }
        if let Some(value) = lookup("NOTIFLOW_HEARTBEAT_MS") {
            let ms: u64 = parse_var("NOTIFLOW_HEARTBEAT_MS", &value)?;
            config = config.map_connections(|c| c.heartbeat_interval(Duration::from_millis(ms)));
        }
        if let Some(value) = lookup("NOTIFLOW_TIMEOUT_MS") {
            let ms: u64 = parse_var("NOTIFLOW_TIMEOUT_MS", &value)?;
            config = config.map_connections(|c| c.connection_timeout(Duration::from_millis(ms)));
        }
        if let Some(value) = lookup("NOTIFLOW_MAX_ATTEMPTS") {
            let attempts: u32 = parse_var("NOTIFLOW_MAX_ATTEMPTS", &value)?;
            config = config.map_connections(|c| {
                let policy = c.reconnection.clone().max_attempts(attempts);
                c.reconnection(policy)
            });
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidVar {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_policy_matches_reference_values() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(30000));
        assert_eq!(policy.backoff_multiplier, 1.5);
    }

    #[test]
    fn delay_grows_geometrically_and_caps() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2250));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_micros(3_375_000));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(30000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(30000));
    }

    #[test]
    fn delay_matches_formula_for_every_attempt() {
        let policy = ReconnectionPolicy::default()
            .base_delay(Duration::from_millis(250))
            .backoff_multiplier(2.0)
            .max_delay(Duration::from_secs(10));
        for n in 0..policy.max_attempts {
            let expected = Duration::from_millis(250 * 2u64.pow(n)).min(Duration::from_secs(10));
            assert_eq!(policy.delay_for_attempt(n), expected, "attempt {n}");
        }
    }

    #[test]
    fn policy_validation() {
        assert!(ReconnectionPolicy::default().validate().is_ok());
        assert_eq!(
            ReconnectionPolicy::default().backoff_multiplier(0.5).validate(),
            Err(ConfigError::InvalidMultiplier(0.5))
        );
        assert!(ReconnectionPolicy::default()
            .backoff_multiplier(f64::NAN)
            .validate()
            .is_err());
        assert!(matches!(
            ReconnectionPolicy::default()
                .max_delay(Duration::from_millis(10))
                .validate(),
            Err(ConfigError::DelayOrder { .. })
        ));
    }

    #[test]
    fn connection_validation() {
        assert!(ConnectionConfig::default().validate().is_ok());
        assert!(matches!(
            ConnectionConfig::new("").validate(),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            ConnectionConfig::new("not a url").validate(),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert_eq!(
            ConnectionConfig::default()
                .heartbeat_interval(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroDuration("heartbeat interval"))
        );
    }

    #[test]
    fn socket_defaults_request_notification_protocol() {
        let config = ManagerConfig::default();
        assert_eq!(config.socket.transport_protocols, vec![DEFAULT_SOCKET_PROTOCOL]);
        assert!(config.streaming.transport_protocols.is_empty());
        assert_eq!(config.fallback_grace, Duration::from_secs(1));
        assert!(config.fallback_enabled);
    }

    #[test]
    fn preference_parsing() {
        assert_eq!("auto".parse(), Ok(ConnectionPreference::Auto));
        assert_eq!("SSE".parse(), Ok(ConnectionPreference::Streaming));
        assert_eq!(" websocket ".parse(), Ok(ConnectionPreference::Socket));
        assert_eq!(
            "carrier-pigeon".parse::<ConnectionPreference>(),
            Err(ConfigError::UnknownPreference("carrier-pigeon".to_string()))
        );
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_defaults_when_unset() {
        let config = ManagerConfig::from_lookup(lookup(&[])).expect("defaults are valid");
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn env_overrides() {
        let config = ManagerConfig::from_lookup(lookup(&[
            ("NOTIFLOW_BASE_URL", "https://api.example.com"),
            ("NOTIFLOW_WS_URL", "wss://push.example.com"),
            ("NOTIFLOW_TRANSPORT", "socket"),
            ("NOTIFLOW_FALLBACK", "false"),
            ("NOTIFLOW_HEARTBEAT_MS", "5000"),
            ("NOTIFLOW_TIMEOUT_MS", "2000"),
            ("NOTIFLOW_MAX_ATTEMPTS", "3"),
        ]))
        .expect("valid overrides");

        assert_eq!(config.preferred, ConnectionPreference::Socket);
        assert!(!config.fallback_enabled);
        assert_eq!(config.streaming.base_url, "https://api.example.com");
        assert_eq!(config.socket.base_url, "wss://push.example.com");
        for c in [&config.streaming, &config.socket] {
            assert_eq!(c.heartbeat_interval, Duration::from_millis(5000));
            assert_eq!(c.connection_timeout, Duration::from_millis(2000));
            assert_eq!(c.reconnection.max_attempts, 3);
        }
    }

    #[test]
    fn env_rejects_garbage() {
        assert_eq!(
            ManagerConfig::from_lookup(lookup(&[("NOTIFLOW_HEARTBEAT_MS", "soon")])),
            Err(ConfigError::InvalidVar {
                var: "NOTIFLOW_HEARTBEAT_MS",
                value: "soon".to_string()
            })
        );
        assert!(ManagerConfig::from_lookup(lookup(&[("NOTIFLOW_TIMEOUT_MS", "0")])).is_err());
    }
}
