use std::env;
use std::path::PathBuf;

/// Environment-sourced configuration: secrets and deployment-specific values.
/// Tunables (pool widths, timeouts, thresholds) live in [`crate::FileConfig`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Postgres connection string. Absent means the in-memory store.
    pub database_url: Option<String>,
    /// Anthropic key for the default enrichment service. Absent disables enrichment.
    pub anthropic_api_key: Option<String>,
    /// Endpoint receiving a JSON notification when a run finishes.
    pub notify_webhook_url: Option<String>,
    /// Path to the TOML tunables file.
    pub config_path: PathBuf,
}

impl AppConfig {
    /// Load from the process environment (after reading `.env` if present).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            database_url: optional_env("DATABASE_URL"),
            anthropic_api_key: optional_env("ANTHROPIC_API_KEY"),
            notify_webhook_url: optional_env("NOTIFY_WEBHOOK_URL"),
            config_path: optional_env("INFLOW_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/inflow.toml")),
        }
    }

    /// Log which settings are present without leaking their values.
    pub fn log_redacted(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview_opt(&self.database_url));
        tracing::info!("  ANTHROPIC_API_KEY: {}", preview_opt(&self.anthropic_api_key));
        tracing::info!("  NOTIFY_WEBHOOK_URL: {}", preview_opt(&self.notify_webhook_url));
        tracing::info!("  INFLOW_CONFIG: {}", self.config_path.display());
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn preview(val: &str) -> String {
    let n = val.char_indices().nth(5).map(|(i, _)| i).unwrap_or(val.len());
    format!("{}...({} chars)", &val[..n], val.len())
}

fn preview_opt(val: &Option<String>) -> String {
    match val {
        Some(v) => preview(v),
        None => "<not set>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_never_shows_more_than_five_chars() {
        assert_eq!(preview("sk-ant-secret"), "sk-an...(13 chars)");
        assert_eq!(preview("abc"), "abc...(3 chars)");
    }
}
