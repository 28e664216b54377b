use std::path::PathBuf;

use snafu::{ResultExt, Snafu};

/// Default server address when nothing is configured.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 6380;

/// Connection settings handed to the transport at construction time.
///
/// Always carried as an explicit value; nothing in this crate keeps
/// connection state in process-wide globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into().trim().to_string(),
            port,
            password: password.into().trim().to_string(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT, "")
    }
}

/// Settings that persist across client restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_host: String,
    pub server_port: u16,
    pub password: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            password: String::new(),
        }
    }
}

impl ClientSettings {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig::new(&self.server_host, self.server_port, &self.password)
    }
}

/// Settings persistence layer using a simple line-based format.
pub struct SettingsStore {
    settings: ClientSettings,
    config_path: PathBuf,
}

impl SettingsStore {
    /// Returns the default config file path relative to the working directory.
    pub fn default_config_path() -> PathBuf {
        PathBuf::from(".murmur").join("settings.conf")
    }

    /// Creates a new settings store with the given config path.
    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings,
            config_path,
        }
    }

    /// Loads settings with the default path.
    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Updates settings and persists to disk.
    pub fn update(&mut self, settings: ClientSettings) -> Result<(), SettingsError> {
        self.persist(&settings)?;
        self.settings = settings;
        Ok(())
    }

    /// Loads settings from disk or returns defaults.
    fn load_from_disk(path: &PathBuf) -> ClientSettings {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                tracing::info!("settings file not found at {:?}, using defaults", path);
                return ClientSettings::default();
            }
        };

        Self::parse_settings(&content)
    }

    /// Parses settings from content using key=value format.
    fn parse_settings(content: &str) -> ClientSettings {
        let mut settings = ClientSettings::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                match key {
                    "server_ip" => settings.server_host = value.to_string(),
                    "port" => {
                        settings.server_port = value.parse().unwrap_or(DEFAULT_SERVER_PORT);
                    }
                    "password" => settings.password = value.to_string(),
                    _ => {}
                }
            }
        }

        settings
    }

    /// Formats settings for persistence.
    fn format_settings(settings: &ClientSettings) -> String {
        format!(
            "# Murmur client settings\n\
             server_ip={}\n\
             port={}\n\
             password={}\n",
            settings.server_host, settings.server_port, settings.password
        )
    }

    /// Persists settings to disk.
    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateConfigDirSnafu {
                stage: "create-config-dir",
                path: parent.to_path_buf(),
            })?;
        }

        let content = Self::format_settings(settings);

        std::fs::write(&self.config_path, content).context(WriteSettingsSnafu {
            stage: "write-settings",
            path: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create config directory at {path:?}: {source}"))]
    CreateConfigDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write settings file to {path:?}: {source}"))]
    WriteSettings {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}
