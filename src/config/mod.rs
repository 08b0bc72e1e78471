use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    /// Retention for message-id records (transport replays).
    pub message_id_window_secs: u64,
    /// Retention for content-fingerprint records (content-level races).
    pub content_window_secs: u64,
    /// How often the background sweep evicts expired records.
    pub sweep_interval_secs: u64,
}

impl DedupConfig {
    pub fn message_id_window(&self) -> Duration {
        Duration::from_secs(self.message_id_window_secs)
    }

    pub fn content_window(&self) -> Duration {
        Duration::from_secs(self.content_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinatorConfig {
    pub timeout_secs: u64,
}

impl CoordinatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub dedup: DedupConfig,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    pub coordinator: CoordinatorConfig,
    pub cors: CorsConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with default values
            .set_default("environment", "development")?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.ws_port", 8081)?
            .set_default("server.http_port", 8080)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("dedup.message_id_window_secs", 600)?
            .set_default("dedup.content_window_secs", 2)?
            .set_default("dedup.sweep_interval_secs", 60)?
            .set_default("heartbeat.interval_secs", 30)?
            .set_default("heartbeat.timeout_secs", 60)?
            .set_default("reconnect.base_delay_ms", 500)?
            .set_default("reconnect.max_delay_ms", 30_000)?
            .set_default("reconnect.max_attempts", 10)?
            .set_default("coordinator.timeout_secs", 60)?
            .set_default("cors.enabled", true)?
            .set_default("cors.allow_any_origin", true)?
            .set_default("cors.max_age", 3600)?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add in settings from environment variables (with prefix "APP_")
            // E.g., `APP_SERVER__WS_PORT=5001` would set `Settings.server.ws_port`
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("environment", "test")?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.ws_port", 0)?
            .set_default("server.http_port", 0)?
            .set_default("server.workers", 1)?
            .set_default("dedup.message_id_window_secs", 600)?
            .set_default("dedup.content_window_secs", 2)?
            .set_default("dedup.sweep_interval_secs", 60)?
            .set_default("heartbeat.interval_secs", 1)?
            .set_default("heartbeat.timeout_secs", 2)?
            .set_default("reconnect.base_delay_ms", 10)?
            .set_default("reconnect.max_delay_ms", 100)?
            .set_default("reconnect.max_attempts", 3)?
            .set_default("coordinator.timeout_secs", 1)?
            .set_default("cors.enabled", false)?
            .set_default("cors.allow_any_origin", false)?
            .set_default("cors.max_age", 0)?
            .build()?
            .try_deserialize()
    }
}
