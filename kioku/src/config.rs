use crate::{Error, LibraryError};
use etcetera::{AppStrategy, AppStrategyArgs, choose_app_strategy};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, read_to_string};
use std::path::PathBuf;

#[allow(clippy::missing_panics_doc)]
pub fn get_config_dir() -> PathBuf {
    let crate_name = env!("CARGO_PKG_NAME");
    if cfg!(feature = "testing") {
        let mut tmp_dir = PathBuf::from("/tmp");
        tmp_dir.push(crate_name);
        tmp_dir.push("config");
        create_dir_all(&tmp_dir).unwrap();
        return tmp_dir;
    }
    let strategy: etcetera::app_strategy::Xdg = choose_app_strategy(AppStrategyArgs {
        top_level_domain: "org".to_string(),
        author: crate_name.to_string(),
        app_name: crate_name.to_string(),
    })
    .unwrap();
    create_dir_all(strategy.config_dir()).unwrap();
    strategy.config_dir()
}

#[allow(clippy::missing_panics_doc)]
pub fn get_data_dir() -> PathBuf {
    let crate_name = env!("CARGO_PKG_NAME");
    if cfg!(feature = "testing") {
        let mut tmp_dir = PathBuf::from("/tmp");
        tmp_dir.push(crate_name);
        tmp_dir.push("data");
        create_dir_all(&tmp_dir).unwrap();
        return tmp_dir;
    }
    let strategy: etcetera::app_strategy::Xdg = choose_app_strategy(AppStrategyArgs {
        top_level_domain: "org".to_string(),
        author: crate_name.to_string(),
        app_name: crate_name.to_string(),
    })
    .unwrap();
    create_dir_all(strategy.data_dir()).unwrap();
    strategy.data_dir()
}

#[derive(Clone, Copy, Debug, strum::EnumString, strum::Display, strum_macros::EnumIter)]
pub enum Environment {
    Production,
    Development,
}

#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub socket_address: String,
    pub database_url: String,
}

pub fn get_env_config(env: Environment) -> EnvironmentConfig {
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
        let mut database_path = get_data_dir();
        database_path.push(match env {
            Environment::Production => "kioku-main.sqlite",
            Environment::Development => "kioku-dev.sqlite",
        });
        format!("sqlite://{}", database_path.display())
    });
    let socket_address = std::env::var("KIOKU_SOCKET_ADDRESS").unwrap_or_else(|_| match env {
        Environment::Production => "127.0.0.1:8080".to_string(),
        Environment::Development => "127.0.0.1:8081".to_string(),
    });

    EnvironmentConfig {
        socket_address,
        database_url,
    }
}

/// Sync tuning knobs. Every value has a fixed default; a `kioku.toml` in the
/// config directory may override individual fields.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Periodic sync tick.
    pub tick_interval_ms: u64,
    /// First retry delay after a failed sync.
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: u32,
    pub max_backoff_ms: u64,
    /// Transport timeout for one push or pull call.
    pub request_timeout_ms: u64,
    /// Upper bound on rows per entity type in one pull page.
    pub pull_page_size: i64,
    /// Daily budget of brand-new cards surfaced by due queries.
    pub new_cards_per_day: i64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            tick_interval_ms: 60_000,
            initial_backoff_ms: 60_000,
            backoff_multiplier: 2,
            max_backoff_ms: 1_800_000,
            request_timeout_ms: 30_000,
            pull_page_size: 1000,
            new_cards_per_day: 20,
        }
    }
}

pub fn read_sync_tuning() -> Result<SyncTuning, Error> {
    let mut config_path = get_config_dir();
    config_path.push("kioku.toml");
    if !config_path.is_file() {
        return Ok(SyncTuning::default());
    }
    let contents = read_to_string(&config_path).map_err(|e| Error::Io {
        description: format!("Failed to read {}", config_path.display()),
        source: e,
    })?;
    let tuning: SyncTuning = toml_edit::de::from_str(&contents)
        .map_err(|e| Error::Library(LibraryError::InvalidConfig(e.to_string())))?;
    Ok(tuning)
}
