use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::ports::{BASE_PORT, DEFAULT_SPAN};

/// How a provisioned server is addressed in its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    /// By container name, resolved on the overlay network.
    Internal,
    /// `0.0.0.0`, reached through the published host port.
    Wildcard,
}

/// Connection parameters injected into every server container.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformConfig {
    pub api_host: String,
    pub api_port: u16,
    pub api_key: String,
    pub database_dsn: String,
    pub broker_address: String,
    pub broker_password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Host path under which `servers/<container>` data directories live.
    pub data_root: PathBuf,
    /// The same directory as seen by this process, when it runs inside a
    /// container with the data root mounted elsewhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_data_root: Option<PathBuf>,
    pub templates_dir: PathBuf,
    /// Registry snapshot; in-memory only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
    pub network_name: String,
    pub server_image: String,
    pub container_data_path: String,
    pub service_port: u16,
    pub provision_timeout_secs: u64,
    /// Interval between orphan cleanup runs; 0 disables the sweep.
    pub orphan_sweep_secs: u64,
    /// Wait before resubscribing after the command subscription drops.
    pub listener_retry_secs: u64,
    pub default_region: String,
    pub bind_mode: BindMode,
    pub port_span: u16,
    pub default_env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_secret: Option<String>,
    pub command_pattern: String,
    pub broker: BrokerConfig,
    pub platform: PlatformConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: "/srv/berth".into(),
            local_data_root: None,
            templates_dir: "preloaded".into(),
            registry_path: Some("berth-registry.json".into()),
            network_name: "berth".into(),
            server_image: "docker.io/itzg/minecraft-server".into(),
            container_data_path: "/data".into(),
            service_port: BASE_PORT,
            provision_timeout_secs: 300,
            orphan_sweep_secs: 600,
            listener_retry_secs: 5,
            default_region: "eu".into(),
            bind_mode: BindMode::Internal,
            port_span: DEFAULT_SPAN,
            default_env: HashMap::from([("EULA".to_string(), "TRUE".to_string())]),
            command_secret: None,
            command_pattern: crate::broker::REQUEST_PATTERN.into(),
            broker: BrokerConfig {
                url: "redis://localhost:6379/0".into(),
            },
            platform: PlatformConfig {
                api_host: "localhost".into(),
                api_port: 8080,
                api_key: String::new(),
                database_dsn: String::new(),
                broker_address: "localhost:6379".into(),
                broker_password: String::new(),
            },
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("berth.toml"))
                .merge(Json::file("berth.json"))
                .merge(Env::prefixed("BERTH_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("BERTH_COMMAND_SECRET_FILE") {
            config.command_secret = Some(std::fs::read_to_string(secret_file)?.trim().to_string());
        }
        if let Ok(key_file) = std::env::var("BERTH_PLATFORM__API_KEY_FILE") {
            config.platform.api_key = std::fs::read_to_string(key_file)?.trim().to_string();
        }

        if config.provision_timeout_secs == 0 {
            anyhow::bail!("provision_timeout_secs must be positive");
        }

        Ok(config)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn orphan_sweep(&self) -> Option<Duration> {
        (self.orphan_sweep_secs > 0).then(|| Duration::from_secs(self.orphan_sweep_secs))
    }

    pub fn listener_retry(&self) -> Duration {
        Duration::from_secs(self.listener_retry_secs)
    }

    /// Where this process creates server data directories.
    pub fn local_data_root(&self) -> &PathBuf {
        self.local_data_root.as_ref().unwrap_or(&self.data_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_through_figment() {
        let config =
            Config::from_figment(Figment::from(Serialized::defaults(Config::default()))).unwrap();
        assert_eq!(config.service_port, 25565);
        assert_eq!(config.default_region, "eu");
        assert_eq!(config.bind_mode, BindMode::Internal);
        assert_eq!(config.local_data_root(), &config.data_root);
        assert!(config.command_secret.is_none());
        assert_eq!(config.orphan_sweep(), Some(Duration::from_secs(600)));
        assert_eq!(config.listener_retry(), Duration::from_secs(5));
    }

    #[test]
    fn zero_sweep_interval_disables_cleanup() {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Serialized::default("orphan_sweep_secs", 0));
        assert!(Config::from_figment(figment).unwrap().orphan_sweep().is_none());
    }

    #[test]
    fn file_layers_override_nested_fields() {
        let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(
            r#"
            network_name = "games"
            bind_mode = "wildcard"
            local_data_root = "/data"

            [platform]
            api_key = "k-123"
            "#,
        ));
        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.network_name, "games");
        assert_eq!(config.bind_mode, BindMode::Wildcard);
        assert_eq!(config.platform.api_key, "k-123");
        assert_eq!(config.platform.api_port, 8080);
        assert_eq!(config.local_data_root(), &PathBuf::from("/data"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Serialized::default("provision_timeout_secs", 0));
        assert!(Config::from_figment(figment).is_err());
    }
}
