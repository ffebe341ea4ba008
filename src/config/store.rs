use std::path::Path;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "TALKLINE_";

/// Load configuration from `path` (if given) and the process environment
pub async fn load(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                AppError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let config: AppConfig = serde_json::from_str(&text).map_err(|e| {
                AppError::Config(format!("Invalid config {}: {}", path.display(), e))
            })?;
            info!("Loaded configuration from {}", path.display());
            config
        }
        None => AppConfig::default(),
    };

    apply_env(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Write configuration as pretty JSON, creating parent directories
pub async fn save(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let json = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, json).await?;
    info!("Saved configuration to {}", path.display());
    Ok(())
}

/// Apply `TALKLINE_*` overrides read through `lookup`.
///
/// TURN is only touched when `TALKLINE_TURN_URL` is set; an empty URL
/// disables it.
pub fn apply_env(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

    if let Some(urls) = var("STUN_URLS") {
        config.ice.stun_servers = urls
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
        debug!("STUN servers from environment: {:?}", config.ice.stun_servers);
    }

    if let Some(url) = var("TURN_URL") {
        config.ice = config
            .ice
            .clone()
            .with_turn(Some(url), var("TURN_USERNAME"), var("TURN_CREDENTIAL"));
        debug!("TURN enabled from environment: {}", config.ice.has_turn());
    }

    if let Some(url) = var("RELAY_URL") {
        config.relay.url = url;
    }
}
