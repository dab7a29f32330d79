use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::command::BuildOptions;
use crate::process;
use crate::supervisor::SupervisorOptions;

fn config_path() -> Result<PathBuf> {
    Ok(process::state_dir()?.join("config.toml"))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell for completions (bash, zsh, fish)
    pub shell: Option<String>,
    /// Editor for `ferret edit` (overrides $VISUAL/$EDITOR)
    pub editor: Option<String>,
    /// Tunnel definitions file (defaults to ~/.ferret/tunnels.toml)
    pub tunnels_file: Option<String>,
    /// ssh client binary
    pub ssh_program: String,
    /// YubiKey Manager CLI binary
    pub ykman_program: String,
    /// Where PIN and TOTP side files are written (defaults to the OS temp dir)
    pub side_file_dir: Option<String>,
    /// `ferret up` without a name starts every tunnel
    pub auto_connect: bool,
    /// Health check timeout in seconds
    pub health_timeout: u64,
    /// Max log file size in bytes before rotation
    pub max_log_size: u64,
    /// Seconds to wait for a YubiKey touch
    pub fetch_timeout: u64,
    /// Seconds before a PIN side file is deleted
    pub pin_file_ttl: u64,
    /// Seconds before a TOTP side file is deleted
    pub totp_file_ttl: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            editor: None,
            tunnels_file: None,
            ssh_program: "ssh".to_string(),
            ykman_program: "ykman".to_string(),
            side_file_dir: None,
            auto_connect: false,
            health_timeout: 5,
            max_log_size: 1_048_576,
            fetch_timeout: 60,
            pin_file_ttl: 5,
            totp_file_ttl: 30,
        }
    }
}

impl Config {
    /// Load config from ~/.ferret/config.toml, falling back to defaults.
    pub fn load() -> Self {
        let path = match config_path() {
            Ok(p) => p,
            Err(_) => return Self::default(),
        };
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    fn parse(content: &str) -> Self {
        toml::from_str(content).unwrap_or_default()
    }

    /// Resolve which editor to use: config > $VISUAL > $EDITOR > vi
    pub fn resolve_editor(&self) -> String {
        if let Some(ref e) = self.editor {
            return e.clone();
        }
        std::env::var("VISUAL")
            .or_else(|_| std::env::var("EDITOR"))
            .unwrap_or_else(|_| "vi".to_string())
    }

    /// Path of the tunnel definitions file.
    pub fn tunnels_path(&self) -> Result<PathBuf> {
        match &self.tunnels_file {
            Some(p) => Ok(expand_home(p)),
            None => Ok(process::state_dir()?.join("tunnels.toml")),
        }
    }

    pub fn supervisor_options(&self) -> Result<SupervisorOptions> {
        let side_file_dir = self
            .side_file_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(std::env::temp_dir);
        Ok(SupervisorOptions {
            build: BuildOptions {
                program: self.ssh_program.clone(),
                side_file_dir,
                pin_file_ttl: Duration::from_secs(self.pin_file_ttl),
                totp_file_ttl: Duration::from_secs(self.totp_file_ttl),
            },
            log_dir: Some(process::log_dir()?),
            max_log_bytes: self.max_log_size,
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            ..SupervisorOptions::default()
        })
    }

    /// Write a default config file if none exists. Returns the path.
    pub fn init() -> Result<PathBuf> {
        let path = config_path()?;
        if path.exists() {
            return Ok(path);
        }
        let default = Self::default();
        let content = toml::to_string_pretty(&default)
            .context("failed to serialize default config")?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
