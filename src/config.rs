//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub instance: InstanceConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file, or ":memory:" for the in-process store
    pub path: PathBuf,
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == ":memory:"
    }
}

/// Federation engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Master switch; when off, federation endpoints answer 404 and no
    /// outbound work is scheduled
    pub enabled: bool,
    /// PEM file holding the instance actor private key
    pub key_path: PathBuf,
    /// Write a fresh key pair to `key_path` when the file is absent
    pub generate_missing_key: bool,
    /// Modulus size for generated RSA keys
    pub rsa_key_bits: usize,
    /// Remote actor cache lifetime in seconds (default: 86400)
    pub actor_cache_ttl_secs: u64,
    /// Delivery queue poll interval in seconds
    pub queue_tick_secs: u64,
    /// Maximum queue items claimed per tick
    pub queue_batch_size: u32,
    /// How long a claimed item stays invisible to other workers
    pub queue_lease_secs: u64,
    /// Concurrent deliveries per tick
    pub delivery_concurrency: usize,
    /// HTTP timeout for a single delivery or fetch
    pub delivery_timeout_secs: u64,
    /// Outbound producer workers
    pub outbound_workers: usize,
    /// Outbound producer channel capacity
    pub outbound_channel_capacity: usize,
    /// Inbound requests per second per remote domain
    pub inbound_requests_per_second: u32,
    /// Inbound body ceiling in bytes (default: 1 MiB)
    pub max_inbound_body_bytes: usize,
    /// Accepted clock skew on the signed Date header
    pub signature_max_skew_secs: i64,
    /// Allow fetches to loopback/private addresses (local testing only)
    pub allow_private_hosts: bool,
}

impl FederationConfig {
    pub fn actor_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.actor_cache_ttl_secs as i64)
    }

    pub fn queue_tick(&self) -> Duration {
        Duration::from_secs(self.queue_tick_secs)
    }

    pub fn queue_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.queue_lease_secs as i64)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    pub description: String,
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Bearer token for the /admin endpoints
    pub token: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIPOST__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("server.domain", "localhost")?
            .set_default("database.path", "data/fedipost.db")?
            .set_default("federation.enabled", true)?
            .set_default("federation.key_path", "data/instance_key.pem")?
            .set_default("federation.generate_missing_key", true)?
            .set_default("federation.rsa_key_bits", 2048)?
            .set_default("federation.actor_cache_ttl_secs", 86_400)?
            .set_default("federation.queue_tick_secs", 10)?
            .set_default("federation.queue_batch_size", 50)?
            .set_default("federation.queue_lease_secs", 300)?
            .set_default("federation.delivery_concurrency", 10)?
            .set_default("federation.delivery_timeout_secs", 30)?
            .set_default("federation.outbound_workers", 4)?
            .set_default("federation.outbound_channel_capacity", 256)?
            .set_default("federation.inbound_requests_per_second", 5)?
            .set_default("federation.max_inbound_body_bytes", 1_048_576)?
            .set_default("federation.signature_max_skew_secs", 300)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("instance.title", "Fedipost")?
            .set_default("instance.description", "A small federated micro-posting server")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FEDIPOST__*)
            .add_source(
                Environment::with_prefix("FEDIPOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_ADMIN_TOKEN_BYTES: usize = 16;

        if self.admin.token.as_bytes().len() < MIN_ADMIN_TOKEN_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "admin.token must be at least {} bytes",
                MIN_ADMIN_TOKEN_BYTES
            )));
        }

        let federation = &self.federation;
        if federation.queue_tick_secs == 0
            || federation.queue_batch_size == 0
            || federation.delivery_concurrency == 0
        {
            return Err(crate::error::AppError::Config(
                "federation queue tick, batch size and concurrency must be greater than 0"
                    .to_string(),
            ));
        }

        if federation.outbound_workers == 0 || federation.outbound_channel_capacity == 0 {
            return Err(crate::error::AppError::Config(
                "federation.outbound_workers and outbound_channel_capacity must be greater than 0"
                    .to_string(),
            ));
        }

        if federation.rsa_key_bits < 1024 {
            return Err(crate::error::AppError::Config(
                "federation.rsa_key_bits must be at least 1024".to_string(),
            ));
        }

        if federation.inbound_requests_per_second == 0 {
            return Err(crate::error::AppError::Config(
                "federation.inbound_requests_per_second must be greater than 0".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            let host = normalized_server_host(&self.server.domain);
            tracing::warn!(
                host = %host,
                protocol = %self.server.protocol,
                "Serving a local domain; remote servers will not be able to federate"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: "localhost".to_string(),
            protocol: "http".to_string(),
        },
        database: DatabaseConfig {
            path: PathBuf::from(":memory:"),
        },
        federation: FederationConfig {
            enabled: true,
            key_path: PathBuf::from("/tmp/fedipost-test-key.pem"),
            generate_missing_key: false,
            rsa_key_bits: 1024,
            actor_cache_ttl_secs: 86_400,
            queue_tick_secs: 10,
            queue_batch_size: 50,
            queue_lease_secs: 300,
            delivery_concurrency: 4,
            delivery_timeout_secs: 5,
            outbound_workers: 2,
            outbound_channel_capacity: 16,
            inbound_requests_per_second: 5,
            max_inbound_body_bytes: 1_048_576,
            signature_max_skew_secs: 300,
            allow_private_hosts: true,
        },
        instance: InstanceConfig {
            title: "Fedipost".to_string(),
            description: "Test instance".to_string(),
        },
        admin: AdminConfig {
            token: "test-admin-token-0123456789".to_string(),
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}
