use crate::error::ConfigError;
use crate::register::RegisterFormat;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum_macros::{Display, EnumString};

pub const DEFAULT_BACKEND_COMMAND: &str = "python -m dashmips debug";

/// Adapter-wide settings, shared by every session the adapter serves.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    /// Host of the backend started by `launch`.
    pub backend_host: String,
    /// Port of the backend started by `launch`.
    pub backend_port: u16,
    /// How long the front end may take to acknowledge a terminal launch.
    pub launch_timeout_ms: u64,
    /// Window for establishing the backend TCP connection.
    pub connect_timeout_ms: u64,
    /// Pause between two connection attempts inside the window.
    pub connect_retry_ms: u64,
    /// Title of the terminal running the backend.
    pub terminal_title: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            backend_host: "localhost".to_string(),
            backend_port: 2390,
            launch_timeout_ms: 2000,
            connect_timeout_ms: 3000,
            connect_retry_ms: 50,
            terminal_title: "Dashmips".to_string(),
        }
    }
}

impl AdapterConfig {
    const DEFAULT_PATH: &'static str = ".config/dashmips-dap/config.toml";

    /// Load config from `path`, or from the default location under the home
    /// directory. A missing default file means default settings, a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match home::home_dir() {
                Some(home) => {
                    let path = home.join(Self::DEFAULT_PATH);
                    if !path.exists() {
                        return Ok(Self::default());
                    }
                    path
                }
                None => return Ok(Self::default()),
            },
        };
        log::debug!(target: "dap", "load config from {}", path.display());

        let data = read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&data).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn from_toml(data: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(data)
    }

    /// Override the launch backend with a `host:port` address.
    pub fn set_backend(&mut self, addr: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidBackend(addr.to_string());
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        self.backend_port = port.parse().map_err(|_| invalid())?;
        self.backend_host = host.to_string();
        Ok(())
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

/// Where the front end should open the backend terminal.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Deserialize, EnumString, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConsoleKind {
    #[default]
    IntegratedTerminal,
    ExternalTerminal,
}

impl ConsoleKind {
    /// Terminal kind as `runInTerminal` expects it.
    pub fn terminal_kind(self) -> &'static str {
        match self {
            ConsoleKind::IntegratedTerminal => "integrated",
            ConsoleKind::ExternalTerminal => "external",
        }
    }
}

/// Arguments of the `launch` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    #[serde(default)]
    pub name: Option<String>,
    /// Path to the program to debug.
    pub program: PathBuf,
    #[serde(default)]
    pub register_format: Option<RegisterFormat>,
    #[serde(default)]
    pub console: ConsoleKind,
    /// Arguments passed to the debugged program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Arguments passed to the backend itself.
    #[serde(default)]
    pub dashmips_args: Vec<String>,
    #[serde(default = "default_backend_command")]
    pub dashmips_command: String,
}

fn default_backend_command() -> String {
    DEFAULT_BACKEND_COMMAND.to_string()
}

/// Arguments of the `attach` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttachArguments {
    #[serde(default = "default_attach_host")]
    pub host: String,
    pub port: u16,
}

fn default_attach_host() -> String {
    "localhost".to_string()
}
