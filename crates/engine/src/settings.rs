//! Engine configuration loaded from the environment.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const MAX_SESSIONS_VAR: &str = "TURNSTILE_MAX_SESSIONS";
pub const LOG_VAR: &str = "TURNSTILE_LOG";

const DEFAULT_LOG_FILTER: &str = "turnstile_engine=info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Upper bound on concurrently registered sessions. 0 means unlimited.
    pub max_active_sessions: usize,
    /// `tracing` filter used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_active_sessions: 0,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl EngineSettings {
    /// Load from the process environment, after `.env.local` / `.env` in the
    /// workspace root.
    pub fn from_env() -> Self {
        load_dotenv_from_repo_root();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_active_sessions: parse_var(&lookup, MAX_SESSIONS_VAR, defaults.max_active_sessions),
            log_filter: lookup(LOG_VAR)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.log_filter),
        }
    }
}

/// Parse `key` with `lookup`, falling back to `default` when it is unset or
/// does not parse.
pub fn parse_var<T>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                key,
                value = %raw,
                error = %e,
                default = %default,
                "Invalid configuration value, using default"
            );
            default
        }
    }
}

fn load_dotenv_from_repo_root() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..");

    // Prefer local overrides.
    for filename in [".env.local", ".env"] {
        let path = repo_root.join(filename);
        if path.exists() {
            let _ = dotenvy::from_path(path);
        }
    }
}
