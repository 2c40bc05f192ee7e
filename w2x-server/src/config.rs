//! Process-level configuration, loaded from environment variables at startup.
//!
//! Everything the orchestration core tunes at runtime lives in the TOML file
//! named by `W2X_CONFIG` instead; see [`w2x_core::Settings`].

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// sqlx SQLite URL (default: `"sqlite://w2x.db"`).
    pub database_url: String,

    /// Settings file, re-read on SIGHUP (default: `"w2x.toml"`).
    /// A missing file means built-in defaults.
    pub settings_path: PathBuf,

    /// `tracing` filter string, e.g. `"info"` or `"w2x_core=debug"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("W2X_BIND", "0.0.0.0:3000"),
            database_url: env_or("W2X_DATABASE_URL", "sqlite://w2x.db"),
            settings_path: PathBuf::from(env_or("W2X_CONFIG", "w2x.toml")),
            log_level: env_or("W2X_LOG", "info"),
            log_json: std::env::var("W2X_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}
