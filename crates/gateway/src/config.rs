// Gateway configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own tuning knobs in db.rs -
// this module covers the core server settings.

use std::net::SocketAddr;

/// Core gateway configuration.
///
/// Constructed via [`GatewayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret used to verify client access tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string for the user/room/message stores.
    /// When absent, the gateway runs with in-memory stores (dev mode).
    pub database_url: Option<String>,
    /// Redis connection string for the pub-sub backplane.
    /// When absent, the gateway runs single-instance over the loopback
    /// backplane.
    pub redis_url: Option<String>,
    /// Log filter directive (e.g. `info`, `parlor_gateway=debug`).
    pub log_filter: String,
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PARLOR_GATEWAY_HOST` | `0.0.0.0` |
    /// | `PARLOR_GATEWAY_PORT` | `8080` |
    /// | `PARLOR_GATEWAY_JWT_SECRET` | dev-only placeholder |
    /// | `PARLOR_GATEWAY_DATABASE_URL` | *(none - in-memory stores)* |
    /// | `PARLOR_GATEWAY_REDIS_URL` | *(none - loopback backplane)* |
    /// | `PARLOR_GATEWAY_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PARLOR_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PARLOR_GATEWAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("PARLOR_GATEWAY_JWT_SECRET")
            .unwrap_or_else(|_| "parlor_local_development_jwt_secret_must_be_32_chars".into());

        let database_url = env("PARLOR_GATEWAY_DATABASE_URL").ok();
        let redis_url = env("PARLOR_GATEWAY_REDIS_URL").ok();

        let log_filter = env("PARLOR_GATEWAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, jwt_secret, database_url, redis_url, log_filter }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == "parlor_local_development_jwt_secret_must_be_32_chars"
    }
}
