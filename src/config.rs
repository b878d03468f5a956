use crate::error::Error;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the supervisor
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Inclusive range of internal ports handed to worker instances
    pub port_range: PortRange,

    /// Supervised applications
    #[serde(default)]
    pub apps: Vec<AppConfig>,

    /// Admin RPC listener
    #[serde(default)]
    pub rpc: RpcConfig,
}

/// Inclusive internal port range shared by all apps
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

/// Configuration for a single supervised application
///
/// # Security Warning
///
/// The `command` field is executed through the shell with the permissions of
/// the supervisor process. Configuration files must be protected with
/// appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Unique app name
    pub name: String,

    /// Command to start one worker instance; spawned with the PORT
    /// environment variable set to the instance's reserved port
    pub command: String,

    /// Health check path polled on the instance until it answers 2xx
    #[serde(default = "default_healthcheck")]
    pub healthcheck: String,

    /// Signal name sent for graceful stop (e.g. "SIGTERM")
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Probe failures tolerated during startup before the instance fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds an instance may spend starting before it fails
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Seconds a stopping instance gets before it is force-killed
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Host worker instances bind and are probed/proxied on
    #[serde(default = "default_internal_host")]
    pub internal_host: String,

    /// Bind address of the app's external listener
    #[serde(default = "default_external_host")]
    pub external_host: String,

    /// Port of the app's external listener
    pub external_port: u16,

    /// Start one instance automatically when the supervisor boots
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

/// Admin RPC listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_host")]
    pub host: String,

    #[serde(default = "default_rpc_port")]
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: default_rpc_host(),
            port: default_rpc_port(),
        }
    }
}

impl AppConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Parsed stop signal; validated at load time
    pub fn stop_signal_code(&self) -> i32 {
        parse_signal(&self.stop_signal).unwrap_or(libc::SIGTERM)
    }

    /// Address the app's external listener binds
    pub fn external_addr(&self) -> String {
        format!("{}:{}", self.external_host, self.external_port)
    }

    /// Validate a single app entry
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig(
                "app name must not be empty".to_string(),
            ));
        }
        if self.command.trim().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "app '{}': 'command' must not be empty",
                self.name
            )));
        }
        if !self.healthcheck.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "app '{}': 'healthcheck' must be an absolute path, got '{}'",
                self.name, self.healthcheck
            )));
        }
        if parse_signal(&self.stop_signal).is_none() {
            return Err(Error::InvalidConfig(format!(
                "app '{}': unknown stop signal '{}'",
                self.name, self.stop_signal
            )));
        }
        if self.external_port == 0 {
            return Err(Error::InvalidConfig(format!(
                "app '{}': 'external_port' must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Map a signal name to its number
pub fn parse_signal(name: &str) -> Option<i32> {
    match name {
        "SIGTERM" => Some(libc::SIGTERM),
        "SIGINT" => Some(libc::SIGINT),
        "SIGQUIT" => Some(libc::SIGQUIT),
        "SIGHUP" => Some(libc::SIGHUP),
        "SIGUSR1" => Some(libc::SIGUSR1),
        "SIGUSR2" => Some(libc::SIGUSR2),
        "SIGKILL" => Some(libc::SIGKILL),
        _ => None,
    }
}

// Default value functions
fn default_healthcheck() -> String {
    "/health".to_string()
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_start_timeout() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_internal_host() -> String {
    "127.0.0.1".to_string()
}

fn default_external_host() -> String {
    "0.0.0.0".to_string()
}

fn default_autostart() -> bool {
    true
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_port() -> u16 {
    9700
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, collecting every problem into one
    /// [`Error::InvalidConfig`]
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();

        if self.port_range.from > self.port_range.to {
            errors.push(format!(
                "port_range is empty: from {} > to {}",
                self.port_range.from, self.port_range.to
            ));
        }

        let mut names = HashSet::new();
        let mut external = HashSet::new();
        for app in &self.apps {
            if let Err(Error::InvalidConfig(reason)) = app.validate() {
                errors.push(reason);
            }
            if !names.insert(app.name.as_str()) {
                errors.push(format!("duplicate app name '{}'", app.name));
            }
            if !external.insert((app.external_host.as_str(), app.external_port)) {
                errors.push(format!(
                    "app '{}': external address {} is used by another app",
                    app.name,
                    app.external_addr()
                ));
            }
        }

        if !errors.is_empty() {
            return Err(Error::InvalidConfig(errors.join("; ")));
        }

        Ok(())
    }
}
