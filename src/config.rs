use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_DOWNLOAD_TTL_HOURS: i64 = 24;
const DEFAULT_STORAGE_BUCKET: &str = "plugin-files";
const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_PAYPAL_API_BASE: &str = "https://api-m.sandbox.paypal.com";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback outside development
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Request timeout applied to the whole router
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// ISO currency used for every checkout
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// HS256 secret shared with the identity provider
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    #[serde(default)]
    pub auth_issuer: Option<String>,

    #[serde(default)]
    pub auth_audience: Option<String>,

    /// Lifetime of a freshly issued download credential
    #[serde(default = "default_download_ttl_hours")]
    #[validate(range(min = 1, max = 720))]
    pub download_ttl_hours: i64,

    /// Pending orders older than this are cancelled by the sweeper; unset disables it
    #[serde(default)]
    #[validate(range(min = 1))]
    pub pending_order_ttl_minutes: Option<i64>,

    #[serde(default = "default_pending_order_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub pending_order_sweep_interval_secs: u64,

    /// Object storage endpoint, e.g. https://project.supabase.co
    #[serde(default)]
    pub storage_url: Option<String>,

    #[serde(default)]
    pub storage_service_key: Option<String>,

    #[serde(default = "default_storage_bucket")]
    pub storage_bucket: String,

    #[serde(default)]
    pub stripe_secret_key: Option<String>,

    #[serde(default = "default_stripe_api_base")]
    pub stripe_api_base: String,

    /// Signing secret for Stripe webhook deliveries
    #[serde(default)]
    pub stripe_webhook_secret: Option<String>,

    #[serde(default = "default_stripe_webhook_tolerance_secs")]
    pub stripe_webhook_tolerance_secs: u64,

    #[serde(default)]
    pub paypal_client_id: Option<String>,

    #[serde(default)]
    pub paypal_client_secret: Option<String>,

    #[serde(default = "default_paypal_api_base")]
    pub paypal_api_base: String,

    #[serde(default)]
    pub paypal_return_url: Option<String>,

    #[serde(default)]
    pub paypal_cancel_url: Option<String>,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials.
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            default_currency: default_currency(),
            jwt_secret,
            auth_issuer: None,
            auth_audience: None,
            download_ttl_hours: default_download_ttl_hours(),
            pending_order_ttl_minutes: None,
            pending_order_sweep_interval_secs: default_pending_order_sweep_interval_secs(),
            storage_url: None,
            storage_service_key: None,
            storage_bucket: default_storage_bucket(),
            stripe_secret_key: None,
            stripe_api_base: default_stripe_api_base(),
            stripe_webhook_secret: None,
            stripe_webhook_tolerance_secs: default_stripe_webhook_tolerance_secs(),
            paypal_client_id: None,
            paypal_client_secret: None,
            paypal_api_base: default_paypal_api_base(),
            paypal_return_url: None,
            paypal_cancel_url: None,
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    pub fn download_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.download_ttl_hours)
    }

    pub fn pending_order_ttl(&self) -> Option<chrono::Duration> {
        self.pending_order_ttl_minutes.map(chrono::Duration::minutes)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if self.storage_url.is_some() && self.storage_service_key.is_none() {
            let mut err = ValidationError::new("storage_service_key_required");
            err.message =
                Some("APP__STORAGE_SERVICE_KEY is required when APP__STORAGE_URL is set".into());
            errors.add("storage_service_key", err);
        }

        if self.paypal_client_id.is_some() != self.paypal_client_secret.is_some() {
            let mut err = ValidationError::new("paypal_credentials_incomplete");
            err.message = Some(
                "APP__PAYPAL_CLIENT_ID and APP__PAYPAL_CLIENT_SECRET must be set together".into(),
            );
            errors.add("paypal_client_secret", err);
        }

        if self.is_production()
            && self.stripe_secret_key.is_some()
            && self.stripe_webhook_secret.is_none()
        {
            let mut err = ValidationError::new("stripe_webhook_secret_required");
            err.message = Some(
                "APP__STRIPE_WEBHOOK_SECRET is required in production when Stripe is enabled"
                    .into(),
            );
            errors.add("stripe_webhook_secret", err);
        }

        // Prices are stored to cents, so the charge currency must use cents too
        // or provider amounts would not match order totals.
        if crate::services::payments::currency_exponent(&self.default_currency) != 2 {
            let mut err = ValidationError::new("default_currency_unsupported");
            err.message = Some(
                format!(
                    "APP__DEFAULT_CURRENCY {} has no minor unit of cents",
                    self.default_currency
                )
                .into(),
            );
            errors.add("default_currency", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    10
}
fn default_db_idle_timeout_secs() -> u64 {
    300
}
fn default_db_acquire_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_download_ttl_hours() -> i64 {
    DEFAULT_DOWNLOAD_TTL_HOURS
}

fn default_pending_order_sweep_interval_secs() -> u64 {
    300
}

fn default_storage_bucket() -> String {
    DEFAULT_STORAGE_BUCKET.to_string()
}

fn default_stripe_api_base() -> String {
    DEFAULT_STRIPE_API_BASE.to_string()
}

fn default_stripe_webhook_tolerance_secs() -> u64 {
    300
}

fn default_paypal_api_base() -> String {
    DEFAULT_PAYPAL_API_BASE.to_string()
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("plugin_market={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration from `./config` and the environment.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. `{dir}/default.toml`
/// 3. `{dir}/{RUN_ENV}.toml`
/// 4. Environment variables (`APP__*`)
pub fn load_config_from(dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            dir.display()
        );
    }

    // jwt_secret has no default and must come from the environment or a config file.
    let config = Config::builder()
        .set_default("database_url", "sqlite://plugin_market.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(dir.join("default")).required(false))
        .add_source(File::from(dir.join(&run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the identity provider's signing secret.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
