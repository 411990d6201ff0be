use crate::utils::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// On-disk/CLI shape of the auth settings. `AuthConfig` (in
/// [`crate::auth`]) is built from this plus the `SOCKS5_USERNAME`,
/// `SOCKS5_PASSWORD` and `SOCKS5_AUTH_REQUIRED` environment variables, which
/// take precedence over file values so credentials need not be committed to
/// a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    1080
}

fn default_max_connections() -> usize {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ProxyError::Config(format!("failed to read config file: {e}")))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides. These take precedence over
    /// whatever was loaded from a config file, matching the common
    /// convention of letting the environment hold secrets.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(username) = std::env::var("SOCKS5_USERNAME") {
            self.auth.username = Some(username);
        }
        if let Ok(password) = std::env::var("SOCKS5_PASSWORD") {
            self.auth.password = Some(password);
        }
        if let Ok(require_auth) = std::env::var("SOCKS5_AUTH_REQUIRED") {
            self.auth.require_auth = matches!(require_auth.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    fn validate(&self) -> Result<()> {
        if self.auth.require_auth && (self.auth.username.is_none() || self.auth.password.is_none())
        {
            return Err(ProxyError::Config(
                "require_auth is set but username/password are not both configured".to_string(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(ProxyError::Config(
                "max_connections must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the [`crate::auth::Authenticator`] config from the final,
    /// env-overridden settings.
    pub fn auth_config(&self) -> crate::auth::AuthConfig {
        let credentials = match (&self.auth.username, &self.auth.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        crate::auth::AuthConfig {
            require_auth: self.auth.require_auth,
            credentials,
        }
    }

    /// Write an example configuration file to `path`.
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[server]
bind_address = "127.0.0.1"
bind_port = 1080
max_connections = 200

[auth]
require_auth = false
# username = "alice"
# password = "secret123"
# Credentials may also be supplied via SOCKS5_USERNAME / SOCKS5_PASSWORD /
# SOCKS5_AUTH_REQUIRED environment variables, which override this file.

[logging]
level = "info"  # "disabled", "debug", "info", "warning", "error", "critical"
"#;

        std::fs::write(path.as_ref(), example)
            .map_err(|e| ProxyError::Config(format!("failed to write example config: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_requires_no_auth() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.bind_port, 1080);
        assert!(!config.auth.require_auth);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn require_auth_without_credentials_is_invalid() {
        let mut config = Config::default();
        config.auth.require_auth = true;
        assert!(config.validate().is_err());

        config.auth.username = Some("alice".to_string());
        config.auth.password = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_max_connections_is_invalid() {
        let mut config = Config::default();
        config.server.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn auth_config_carries_credentials_through() {
        let mut config = Config::default();
        config.auth.require_auth = true;
        config.auth.username = Some("alice".to_string());
        config.auth.password = Some("secret".to_string());

        let auth_config = config.auth_config();
        assert!(auth_config.require_auth);
        assert_eq!(
            auth_config.credentials,
            Some(("alice".to_string(), "secret".to_string()))
        );
    }
}
