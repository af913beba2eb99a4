// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables in
// `db::pool`; this module covers the core server settings.

use std::net::SocketAddr;

pub const DEV_JWT_SECRET: &str = "collab_local_development_jwt_secret_must_be_32_chars";

const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const DEFAULT_TOKEN_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Shared HS256 secret used by the token issuer.
    pub jwt_secret: String,
    /// Lifetime of tokens issued by [`crate::auth::jwt::JwtTokenVerifier::issue_token`].
    /// The relay only verifies tokens in production, so this affects nothing
    /// unless the process issues tokens itself (local tooling and tests).
    pub token_ttl_minutes: i64,
    /// PostgreSQL connection string. `None` selects the in-memory stores.
    pub database_url: Option<String>,
    /// Apply the embedded migrations on startup.
    pub run_migrations: bool,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `collab_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Per-connection outbound queue depth before a peer counts as stalled.
    pub outbound_queue_capacity: usize,
    /// Largest inbound WebSocket message accepted.
    pub max_message_bytes: usize,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `COLLAB_RELAY_HOST` | `0.0.0.0` |
    /// | `COLLAB_RELAY_PORT` | `8080` |
    /// | `COLLAB_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `COLLAB_RELAY_TOKEN_TTL_MINUTES` | `30` |
    /// | `COLLAB_RELAY_DATABASE_URL` | *(none, in-memory stores)* |
    /// | `COLLAB_RELAY_RUN_MIGRATIONS` | `false` |
    /// | `COLLAB_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `COLLAB_RELAY_LOG_FILTER` | `info` |
    /// | `COLLAB_RELAY_LOG_FORMAT` | `text` |
    /// | `COLLAB_RELAY_OUTBOUND_QUEUE` | `256` |
    /// | `COLLAB_RELAY_MAX_MESSAGE_BYTES` | `1048576` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COLLAB_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("COLLAB_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("COLLAB_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let token_ttl_minutes = env("COLLAB_RELAY_TOKEN_TTL_MINUTES")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|minutes| *minutes > 0)
            .unwrap_or(DEFAULT_TOKEN_TTL_MINUTES);

        let database_url = env("COLLAB_RELAY_DATABASE_URL").ok().filter(|url| !url.is_empty());
        let run_migrations = env("COLLAB_RELAY_RUN_MIGRATIONS")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let cors_origins = env("COLLAB_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("COLLAB_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("COLLAB_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let outbound_queue_capacity = env("COLLAB_RELAY_OUTBOUND_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|capacity| *capacity > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY);
        let max_message_bytes = env("COLLAB_RELAY_MAX_MESSAGE_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|bytes| *bytes > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);

        Self {
            listen_addr,
            jwt_secret,
            token_ttl_minutes,
            database_url,
            run_migrations,
            cors_origins,
            log_filter,
            log_format,
            outbound_queue_capacity,
            max_message_bytes,
        }
    }

    /// Token lifetime in seconds, or `None` when the minute count overflows.
    pub fn token_ttl_seconds(&self) -> Option<i64> {
        self.token_ttl_minutes.checked_mul(60)
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
