use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Credentials for pulling from and pushing to a registry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RegistryConfig {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Container and image the `docker-ext` binary updates.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UpdateTarget {
    pub container: String,
    pub image: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// `unix://…`, `tcp://…` or `http://…`; unset uses the local defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
    pub client_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub force_remove: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<UpdateTarget>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_host: None,
            client_timeout_secs: 120,
            verify_timeout_secs: 30,
            poll_interval_ms: 500,
            force_remove: true,
            registry: None,
            target: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("docker-ext.toml"))
                .merge(Json::file("docker-ext.json"))
                .merge(Env::prefixed("DOCKER_EXT_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("DOCKER_EXT_REGISTRY_PASSWORD_FILE") {
            let password = std::fs::read_to_string(secret_file)?.trim().to_string();
            match config.registry.as_mut() {
                Some(registry) => registry.password = Some(password),
                None => anyhow::bail!("registry password file given without a registry"),
            }
        }

        if config.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }

        Ok(config)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_sources() {
        Jail::expect_with(|_jail| {
            let config = Config::load().expect("defaults load");
            assert_eq!(config.docker_host, None);
            assert_eq!(config.verify_timeout(), Duration::from_secs(30));
            assert_eq!(config.poll_interval(), Duration::from_millis(500));
            assert!(config.force_remove);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "docker-ext.toml",
                r#"
                    docker_host = "unix:///run/docker.sock"
                    verify_timeout_secs = 10

                    [target]
                    container = "web"
                    image = "app:2"
                "#,
            )?;
            jail.set_env("DOCKER_EXT_VERIFY_TIMEOUT_SECS", "45");
            jail.set_env("DOCKER_EXT_REGISTRY__SERVER", "registry.local");

            let config = Config::load().expect("config loads");
            assert_eq!(config.docker_host.as_deref(), Some("unix:///run/docker.sock"));
            assert_eq!(config.verify_timeout_secs, 45);
            assert_eq!(
                config.target,
                Some(UpdateTarget {
                    container: "web".into(),
                    image: "app:2".into(),
                })
            );
            assert_eq!(config.registry.unwrap().server, "registry.local");
            Ok(())
        });
    }

    #[test]
    fn password_file_fills_registry_password() {
        Jail::expect_with(|jail| {
            jail.create_file("secret", "hunter2\n")?;
            jail.set_env("DOCKER_EXT_REGISTRY__SERVER", "registry.local");
            jail.set_env("DOCKER_EXT_REGISTRY__USERNAME", "ci");
            jail.set_env("DOCKER_EXT_REGISTRY_PASSWORD_FILE", "secret");

            let registry = Config::load().expect("config loads").registry.unwrap();
            assert_eq!(registry.username.as_deref(), Some("ci"));
            assert_eq!(registry.password.as_deref(), Some("hunter2"));
            Ok(())
        });
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("DOCKER_EXT_POLL_INTERVAL_MS", "0");
            assert!(Config::load().is_err());
            Ok(())
        });
    }
}
