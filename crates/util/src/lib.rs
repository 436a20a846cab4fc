pub mod config;

use std::{env, net::SocketAddr};

pub use config::{
    AppConfig, BoldSignConfig, ConfigError, EmailConfig, Environment, ObjectStoreConfig,
    WebhookVerification,
};

/// Where the webhook receiver listens unless `APP_BIND_ADDR` says otherwise.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Reads a local `.env` (webhook secret, BoldSign client credentials, storage
/// and email keys) into the process environment. Variables already present
/// win, and a missing file is not an error.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// Socket address for the webhook receiver. A blank `APP_BIND_ADDR` counts
/// as unset.
pub fn server_bind_address() -> Result<SocketAddr, std::net::AddrParseError> {
    env::var("APP_BIND_ADDR")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
        .parse()
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::sync::{LazyLock, Mutex};

    /// Serialises tests that mutate process environment variables.
    pub static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));
}
