use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;
use crate::totp;

/// How the external ssh client authenticates against the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    #[default]
    Password,
    PrivateKey,
    Certificate,
    KeyboardInteractive,
    #[value(name = "yubikey-piv")]
    #[serde(rename = "yubikey-piv")]
    YubiKeyPiv,
    #[value(name = "yubikey-oath")]
    #[serde(rename = "yubikey-oath")]
    YubiKeyOath,
    #[value(name = "yubikey-challenge-response")]
    #[serde(rename = "yubikey-challenge-response")]
    YubiKeyChallengeResponse,
}

impl AuthMethod {
    /// Whether activating this method needs a YubiKey plugged in.
    pub fn needs_yubikey(self) -> bool {
        matches!(
            self,
            AuthMethod::YubiKeyPiv | AuthMethod::YubiKeyOath | AuthMethod::YubiKeyChallengeResponse
        )
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthMethod::Password => "password",
            AuthMethod::PrivateKey => "private-key",
            AuthMethod::Certificate => "certificate",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
            AuthMethod::YubiKeyPiv => "yubikey-piv",
            AuthMethod::YubiKeyOath => "yubikey-oath",
            AuthMethod::YubiKeyChallengeResponse => "yubikey-challenge-response",
        };
        f.write_str(s)
    }
}

/// A single port forward: local_port -> remote_host:remote_port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl std::fmt::Display for PortForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

/// One forwarding rule together with everything needed to authenticate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub name: String,
    pub server_host: String,
    pub server_port: u16,
    pub username: String,

    pub auth_method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_passphrase: Option<String>,
    /// PKCS#11 provider used for certificate authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<PathBuf>,
    pub use_totp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yubikey_pin: Option<String>,
    /// PKCS#11 provider library for PIV mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yubikey_provider: Option<PathBuf>,
    /// OATH account name; the first account is used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yubikey_oath_account: Option<String>,

    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub use_encryption: bool,

    /// Seconds; 0 leaves ssh's default
    pub connection_timeout: u32,
    /// Seconds; 0 disables keep-alives
    pub keep_alive_interval: u32,
    pub compression: bool,
    /// Additional ssh arguments, split on whitespace
    pub extra_options: String,

    /// Owned by the supervisor; never trusted from storage.
    pub is_active: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            server_host: String::new(),
            server_port: 22,
            username: String::new(),
            auth_method: AuthMethod::Password,
            password: None,
            private_key_path: None,
            private_key_passphrase: None,
            certificate_path: None,
            use_totp: false,
            totp_secret: None,
            yubikey_pin: None,
            yubikey_provider: None,
            yubikey_oath_account: None,
            local_port: 0,
            remote_host: "localhost".to_string(),
            remote_port: 0,
            use_encryption: false,
            connection_timeout: 30,
            keep_alive_interval: 60,
            compression: true,
            extra_options: String::new(),
            is_active: false,
        }
    }
}

impl TunnelConfig {
    pub fn new(
        name: impl Into<String>,
        server_host: impl Into<String>,
        username: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            server_host: server_host.into(),
            username: username.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            ..Self::default()
        }
    }

    pub fn forward(&self) -> PortForward {
        PortForward {
            local_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
        }
    }

    /// `user@host` destination passed to ssh.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.server_host)
    }

    /// Check the invariants that must hold before a session may start.
    ///
    /// File existence is checked here too, so the result depends on the
    /// filesystem at call time.
    pub fn validate(&self) -> Result<(), TunnelError> {
        let invalid = |reason: &str| TunnelError::config_invalid(&self.name, reason);

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.server_host.trim().is_empty() {
            return Err(invalid("server host is empty"));
        }
        if self.username.trim().is_empty() {
            return Err(invalid("username is empty"));
        }
        if self.remote_host.trim().is_empty() {
            return Err(invalid("remote host is empty"));
        }
        if self.server_port == 0 {
            return Err(invalid("server port must be in 1-65535"));
        }
        if self.local_port == 0 {
            return Err(invalid("local port must be in 1-65535"));
        }
        if self.remote_port == 0 {
            return Err(invalid("remote port must be in 1-65535"));
        }

        if self.use_totp {
            let secret = non_empty(&self.totp_secret).ok_or_else(|| invalid("TOTP is enabled but the secret is empty"))?;
            totp::decode_secret(secret)
                .map_err(|e| invalid(&format!("TOTP secret is not valid base32: {}", e)))?;
        }

        match self.auth_method {
            AuthMethod::PrivateKey => {
                let path = self
                    .private_key_path
                    .as_ref()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or_else(|| invalid("private key path is empty"))?;
                if !path.is_file() {
                    return Err(invalid(&format!("private key {} does not exist", path.display())));
                }
            }
            AuthMethod::Certificate => {
                if self
                    .certificate_path
                    .as_ref()
                    .is_none_or(|p| p.as_os_str().is_empty())
                {
                    return Err(invalid("certificate provider path is empty"));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Treat `Some("")` the same as `None`.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}
