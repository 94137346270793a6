//! Application configuration.
//!
//! All settings come from `TRACKER_*` environment variables (loaded from a
//! `.env` file when present) with CLI flags able to override the basics.
//! A missing AI key is not an error: the advisory layer runs degraded.

use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_DB_PATH: &str = "tracker.db";
pub const DEFAULT_UPLOADS_DIR: &str = "uploads";
pub const DEFAULT_TOKEN_EXPIRY_HOURS: i64 = 24;
pub const DEFAULT_AI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_AI_TIMEOUT_SECS: u64 = 10;

const DEFAULT_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_path: PathBuf,
    pub uploads_dir: PathBuf,
    pub jwt_secret: String,
    pub token_expiry_hours: i64,
    pub ai_api_key: Option<String>,
    pub ai_base_url: String,
    pub ai_model: String,
    pub ai_timeout_secs: u64,
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_path: PathBuf::from(DEFAULT_DB_PATH),
            uploads_dir: PathBuf::from(DEFAULT_UPLOADS_DIR),
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            token_expiry_hours: DEFAULT_TOKEN_EXPIRY_HOURS,
            ai_api_key: None,
            ai_base_url: DEFAULT_AI_BASE_URL.to_string(),
            ai_model: DEFAULT_AI_MODEL.to_string(),
            ai_timeout_secs: DEFAULT_AI_TIMEOUT_SECS,
            dev_mode: false,
        }
    }
}

impl AppConfig {
    /// Build configuration from the environment, falling back to defaults.
    /// Malformed numeric values fall back rather than abort; a warning is
    /// logged so misconfiguration is visible.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let jwt_secret = match env_var("TRACKER_JWT_SECRET") {
            Some(s) => s,
            None => {
                tracing::warn!(
                    "TRACKER_JWT_SECRET not set; using a built-in development secret"
                );
                defaults.jwt_secret.clone()
            }
        };

        Self {
            port: parse_or("TRACKER_PORT", defaults.port),
            database_path: env_var("TRACKER_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            uploads_dir: env_var("TRACKER_UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.uploads_dir),
            jwt_secret,
            token_expiry_hours: parse_or("TRACKER_TOKEN_EXPIRY_HOURS", defaults.token_expiry_hours),
            ai_api_key: env_var("TRACKER_AI_API_KEY"),
            ai_base_url: env_var("TRACKER_AI_BASE_URL").unwrap_or(defaults.ai_base_url),
            ai_model: env_var("TRACKER_AI_MODEL").unwrap_or(defaults.ai_model),
            ai_timeout_secs: parse_or("TRACKER_AI_TIMEOUT_SECS", defaults.ai_timeout_secs),
            dev_mode: env_var("TRACKER_DEV_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.dev_mode),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env_var(name) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "invalid value, using default");
                default
            }
        },
        None => default,
    }
}
