//! Service configuration.
//!
//! Values come from an optional YAML file, overlaid by environment variables
//! of the form `ORDERCORE__SECTION__KEY` (for example
//! `ORDERCORE__DATABASE__URL`). Every section has defaults, so the service
//! starts against the in-memory store with no configuration at all.

use std::num::NonZeroU32;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use ordercore::{CoordinatorConfig, LockOrdering, OrderTimeoutMs, TotalPolicy};
use ordercore_postgres::{MaxConnections, PostgresConfig};
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "ORDERCORE_CONFIG_PATH";

/// File read when [`CONFIG_PATH_VAR`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config/ordercore.yaml";

const ENV_PREFIX: &str = "ORDERCORE";
const ENV_SEPARATOR: &str = "__";
const LOCAL_ENV: &str = "local";

/// Why the configuration could not be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration")]
    Load(#[from] config::ConfigError),

    /// Every problem found, not just the first.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Storage backend behind the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Process-local maps, lost on exit.
    #[default]
    Memory,
    /// PostgreSQL at `database.url`.
    Postgres,
}

/// Listener and request handling settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// Interface to bind.
    pub address: String,
    pub port: u16,
    /// Requests still running after this long are answered with 503.
    pub request_timeout_secs: u64,
    /// Grace period for in-flight requests once a shutdown signal arrives.
    pub shutdown_timeout_secs: u64,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_owned(),
            port: 8080,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 10,
        }
    }
}

impl HttpServerConfig {
    /// `address:port`, as accepted by `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// [`Self::request_timeout_secs`] as a [`Duration`].
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// [`Self::shutdown_timeout_secs`] as a [`Duration`].
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Storage selection and connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: Backend,
    /// Connection string, required for [`Backend::Postgres`].
    pub url: String,
    /// Pool size. Must be positive.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout_secs: u64,
    /// Row lock wait limit. `0` waits forever.
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            url: String::new(),
            max_connections: 10,
            acquire_timeout_secs: 30,
            lock_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    /// Row lock wait limit, `None` when unbounded.
    pub const fn lock_timeout(&self) -> Option<Duration> {
        match self.lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Order placement behaviour, mapped onto [`CoordinatorConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrdersConfig {
    /// Deadline for one order transaction, in milliseconds.
    pub timeout_ms: u64,
    pub lock_ordering: LockOrdering,
    pub total_policy: TotalPolicy,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            timeout_ms: OrderTimeoutMs::default().into_inner(),
            lock_ordering: LockOrdering::default(),
            total_policy: TotalPolicy::default(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Deployment environment name. `local` switches logs to a human format.
    pub env: String,
    pub http_server: HttpServerConfig,
    pub database: DatabaseConfig,
    pub orders: OrdersConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            env: LOCAL_ENV.to_owned(),
            http_server: HttpServerConfig::default(),
            database: DatabaseConfig::default(),
            orders: OrdersConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the file named by `ORDERCORE_CONFIG_PATH` (or the default
    /// path) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        Self::load_from(&path)
    }

    /// Load from `path` (which may be missing) and the process environment.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        Self::from_builder(
            config::Config::builder()
                .add_source(File::with_name(path).required(false))
                .add_source(
                    Environment::with_prefix(ENV_PREFIX)
                        .prefix_separator(ENV_SEPARATOR)
                        .separator(ENV_SEPARATOR)
                        .try_parsing(true),
                ),
        )
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Whether this is a developer machine.
    pub fn is_local(&self) -> bool {
        self.env == LOCAL_ENV
    }

    /// Check every field and report all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.env.trim().is_empty() {
            problems.push("env must not be empty".to_owned());
        }
        if self.http_server.address.trim().is_empty() {
            problems.push("http_server.address must not be empty".to_owned());
        }
        if self.http_server.port == 0 {
            problems.push("http_server.port must not be 0".to_owned());
        }
        if self.http_server.request_timeout_secs == 0 {
            problems.push("http_server.request_timeout_secs must be positive".to_owned());
        }
        if self.database.backend == Backend::Postgres && self.database.url.trim().is_empty() {
            problems.push("database.url is required for the postgres backend".to_owned());
        }
        if self.database.max_connections == 0 {
            problems.push("database.max_connections must be positive".to_owned());
        }
        if self.database.acquire_timeout_secs == 0 {
            problems.push("database.acquire_timeout_secs must be positive".to_owned());
        }
        if let Err(error) = OrderTimeoutMs::try_new(self.orders.timeout_ms) {
            problems.push(format!("orders.timeout_ms: {error}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Coordinator settings from the `orders` section.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when `orders.timeout_ms` is out of range.
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig, ConfigError> {
        let order_timeout = OrderTimeoutMs::try_new(self.orders.timeout_ms)
            .map_err(|error| ConfigError::Invalid(vec![format!("orders.timeout_ms: {error}")]))?;
        Ok(CoordinatorConfig::default()
            .with_order_timeout(order_timeout)
            .with_lock_ordering(self.orders.lock_ordering)
            .with_total_policy(self.orders.total_policy))
    }

    /// Pool and lock settings for the Postgres store.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when `database.max_connections` is zero.
    pub fn postgres_config(&self) -> Result<PostgresConfig, ConfigError> {
        let max_connections = NonZeroU32::new(self.database.max_connections).ok_or_else(|| {
            ConfigError::Invalid(vec!["database.max_connections must be positive".to_owned()])
        })?;
        Ok(PostgresConfig {
            max_connections: MaxConnections::new(max_connections),
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_secs),
            lock_timeout: self.database.lock_timeout(),
            ..PostgresConfig::default()
        })
    }
}
