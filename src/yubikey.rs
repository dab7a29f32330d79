//! Bridge to a YubiKey through the `ykman` command-line tool.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum YubiKeyError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {command} exited with {status}: {stderr}")]
    Failed {
        program: String,
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("no OATH code available")]
    NoCode,

    #[error("empty challenge response")]
    EmptyResponse,
}

/// Operations the tunnel core needs from a hardware key.
///
/// Fetches may wait on a human touching the key, so callers must not hold
/// locks across them.
#[async_trait]
pub trait YubiKey: Send + Sync {
    async fn is_present(&self) -> bool;

    /// Current OATH TOTP code for `account`, or for the first account when `None`.
    async fn oath_code(&self, account: Option<&str>) -> Result<String, YubiKeyError>;

    /// HMAC-SHA1 challenge-response from slot 2.
    async fn challenge_response(&self, challenge: &str) -> Result<String, YubiKeyError>;
}

/// `ykman`-backed implementation.
pub struct Ykman {
    program: String,
}

impl Ykman {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, YubiKeyError> {
        debug!("running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| YubiKeyError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(YubiKeyError::Failed {
                program: self.program.clone(),
                command: args.first().copied().unwrap_or_default().to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for Ykman {
    fn default() -> Self {
        Self::new("ykman")
    }
}

#[async_trait]
impl YubiKey for Ykman {
    async fn is_present(&self) -> bool {
        match self.run(&["list"]).await {
            Ok(out) => device_listed(&out),
            Err(e) => {
                debug!("yubikey detection failed: {}", e);
                false
            }
        }
    }

    async fn oath_code(&self, account: Option<&str>) -> Result<String, YubiKeyError> {
        let mut args = vec!["oath", "accounts", "code"];
        if let Some(a) = account {
            args.push(a);
        }
        let out = self.run(&args).await?;
        parse_oath_output(&out).ok_or(YubiKeyError::NoCode)
    }

    async fn challenge_response(&self, challenge: &str) -> Result<String, YubiKeyError> {
        let hex = hex::encode(challenge.as_bytes());
        let out = self.run(&["otp", "calculate", "2", &hex]).await?;
        let response = out.trim();
        if response.is_empty() {
            return Err(YubiKeyError::EmptyResponse);
        }
        Ok(response.to_string())
    }
}

fn device_listed(output: &str) -> bool {
    let output = output.trim();
    !output.is_empty() && !output.contains("No YubiKey detected")
}

/// First line of `ykman oath accounts code` looks like `issuer:account  123456`.
fn parse_oath_output(output: &str) -> Option<String> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let code = line.split_whitespace().last()?;
    if code.chars().all(|c| c.is_ascii_digit()) {
        Some(code.to_string())
    } else {
        None
    }
}
