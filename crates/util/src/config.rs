use std::{env, fmt, net::SocketAddr};

use url::Url;

use super::server_bind_address;

const DEFAULT_DATABASE_URL: &str = "sqlite://esign.db?mode=rwc";
const DEFAULT_BOLDSIGN_API_BASE: &str = "https://api.boldsign.com/";
const DEFAULT_BOLDSIGN_TOKEN_URL: &str = "https://account.boldsign.com/connect/token";
const DEFAULT_EMAIL_API_BASE: &str = "https://api.resend.com/";
const DEFAULT_EMAIL_FROM: &str = "no-reply@example.com";
const DEFAULT_STORAGE_BUCKET: &str = "documents";
const DEFAULT_APP_BASE_URL: &str = "http://localhost:3000/";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// How inbound webhook signatures are checked.
#[derive(Clone, PartialEq, Eq)]
pub enum WebhookVerification {
    /// HMAC-SHA256 with the shared secret configured at the provider.
    Secret(String),
    /// No secret configured; requests are accepted unverified. Only reachable
    /// through `WEBHOOK_INSECURE_BOOTSTRAP=true`.
    InsecureBootstrap,
}

impl fmt::Debug for WebhookVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("Secret(<redacted>)"),
            Self::InsecureBootstrap => f.write_str("InsecureBootstrap"),
        }
    }
}

/// Credentials and endpoints for the e-signature provider.
#[derive(Debug, Clone)]
pub struct BoldSignConfig {
    pub api_base: Url,
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
}

/// Object storage used to persist signed PDFs.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub api_base: Url,
    pub service_key: String,
    pub bucket: String,
}

/// Transactional email provider settings.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_base: Url,
    pub api_key: String,
    pub from: String,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub webhook: WebhookVerification,
    pub boldsign: BoldSignConfig,
    pub object_store: ObjectStoreConfig,
    pub email: EmailConfig,
    pub app_base_url: Url,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url = optional("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.into());

        let webhook = match optional("BOLDSIGN_WEBHOOK_SECRET") {
            Some(secret) => WebhookVerification::Secret(secret),
            None if flag("WEBHOOK_INSECURE_BOOTSTRAP")? => WebhookVerification::InsecureBootstrap,
            None => return Err(ConfigError::MissingWebhookSecret),
        };

        let boldsign = BoldSignConfig {
            api_base: url_var("BOLDSIGN_API_BASE", DEFAULT_BOLDSIGN_API_BASE)?,
            token_url: endpoint_var("BOLDSIGN_TOKEN_URL", DEFAULT_BOLDSIGN_TOKEN_URL)?,
            client_id: credential("BOLDSIGN_CLIENT_ID", environment)?,
            client_secret: credential("BOLDSIGN_CLIENT_SECRET", environment)?,
        };

        let object_store = ObjectStoreConfig {
            api_base: required_url("STORAGE_API_BASE", environment)?,
            service_key: credential("STORAGE_SERVICE_KEY", environment)?,
            bucket: optional("STORAGE_BUCKET").unwrap_or_else(|| DEFAULT_STORAGE_BUCKET.into()),
        };

        let email = EmailConfig {
            api_base: url_var("EMAIL_API_BASE", DEFAULT_EMAIL_API_BASE)?,
            api_key: credential("EMAIL_API_KEY", environment)?,
            from: optional("EMAIL_FROM").unwrap_or_else(|| DEFAULT_EMAIL_FROM.into()),
        };

        let app_base_url = url_var("APP_BASE_URL", DEFAULT_APP_BASE_URL)?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            webhook,
            boldsign,
            object_store,
            email,
            app_base_url,
        })
    }
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn flag(name: &'static str) -> Result<bool, ConfigError> {
    match optional(name).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes") => Ok(true),
        Some("0" | "false" | "no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidFlag {
            name,
            value: other.to_string(),
        }),
    }
}

/// Credentials are mandatory in production; elsewhere an empty value lets the
/// service boot and the corresponding outbound calls fail at request time.
fn credential(name: &'static str, environment: Environment) -> Result<String, ConfigError> {
    match optional(name) {
        Some(value) => Ok(value),
        None if environment == Environment::Production => Err(ConfigError::MissingVariable(name)),
        None => Ok(String::new()),
    }
}

fn url_var(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let raw = optional(name).unwrap_or_else(|| default.to_string());
    parse_url(name, &raw)
}

/// Full endpoint URLs are used as given.
fn endpoint_var(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let raw = optional(name).unwrap_or_else(|| default.to_string());
    Url::parse(&raw).map_err(|err| ConfigError::InvalidUrl { name, source: err })
}

fn required_url(name: &'static str, environment: Environment) -> Result<Url, ConfigError> {
    match optional(name) {
        Some(raw) => parse_url(name, &raw),
        None if environment == Environment::Production => Err(ConfigError::MissingVariable(name)),
        None => parse_url(name, "http://localhost:54321/"),
    }
}

fn parse_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    // Base URLs are joined with relative paths later, so they must end in '/'.
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|err| ConfigError::InvalidUrl { name, source: err })
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingWebhookSecret,
    MissingVariable(&'static str),
    InvalidFlag {
        name: &'static str,
        value: String,
    },
    InvalidUrl {
        name: &'static str,
        source: url::ParseError,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingWebhookSecret => write!(
                f,
                "BOLDSIGN_WEBHOOK_SECRET is not set; set WEBHOOK_INSECURE_BOOTSTRAP=true to accept unsigned webhooks"
            ),
            Self::MissingVariable(name) => write!(f, "{name} must be set"),
            Self::InvalidFlag { name, value } => {
                write!(f, "{name} must be a boolean flag (got {value})")
            }
            Self::InvalidUrl { name, source } => write!(f, "invalid {name} value: {source}"),
        }
    }
}

impl std::error::Error for ConfigError {}
