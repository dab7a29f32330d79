//! Translate a [`TunnelConfig`] into everything needed to launch ssh for it.
//!
//! Building is pure apart from generating side-file names: nothing is written
//! to disk here. The supervisor writes the side files and schedules their
//! deletion.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TunnelError;
use crate::tunnel::{AuthMethod, TunnelConfig, non_empty};

/// A string that must never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// What to do when a prompt rule matches a line of ssh output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptAction {
    /// Write the secret followed by a newline to stdin.
    WriteSecret(Secret),
    /// Compute a TOTP code at match time and write it.
    Totp { secret: Secret },
    /// Fetch an OATH code from the YubiKey, then write it.
    OathCode { account: Option<String> },
    /// Extract the challenge from the line, ask the YubiKey, write the response.
    ChallengeResponse,
    /// Tell the operator to do something ssh is waiting for.
    Notify(String),
}

impl PromptAction {
    pub fn writes_stdin(&self) -> bool {
        !matches!(self, PromptAction::Notify(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRule {
    /// Lowercase substring matched against lowercased output lines.
    pub pattern: String,
    pub action: PromptAction,
}

impl PromptRule {
    pub fn new(pattern: &str, action: PromptAction) -> Self {
        Self {
            pattern: pattern.to_lowercase(),
            action,
        }
    }

    pub fn matches(&self, line: &str) -> bool {
        line.to_lowercase().contains(&self.pattern)
    }
}

/// A file that has to exist while ssh starts and be deleted afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideFile {
    pub path: PathBuf,
    pub contents: Secret,
    pub delete_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Fed to ssh as stdin instead of a pipe.
    pub stdin_file: Option<PathBuf>,
    pub side_files: Vec<SideFile>,
    pub rules: Vec<PromptRule>,
}

impl LaunchPlan {
    /// Command line for display; secrets never appear in argv.
    pub fn display_command(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            if arg.contains(char::is_whitespace) {
                s.push('"');
                s.push_str(arg);
                s.push('"');
            } else {
                s.push_str(arg);
            }
        }
        s
    }
}

/// Secrets computed right before launch.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSecrets {
    pub totp_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub program: String,
    pub side_file_dir: PathBuf,
    pub pin_file_ttl: Duration,
    pub totp_file_ttl: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            side_file_dir: std::env::temp_dir(),
            pin_file_ttl: Duration::from_secs(5),
            totp_file_ttl: Duration::from_secs(30),
        }
    }
}

const PASSWORD_PROMPT: &str = "password";
const PASSPHRASE_PROMPT: &str = "passphrase";
const VERIFICATION_PROMPT: &str = "verification code";
const CHALLENGE_PROMPT: &str = "challenge";
const PIN_PROMPT: &str = "enter pin";
const PRESENCE_PROMPT: &str = "confirm user presence";
const CODE_PROMPT: &str = "code";

/// Build the launch plan for `config`.
///
/// Fails with [`TunnelError::ConfigInvalid`] before producing any side file
/// when the configuration cannot be launched.
pub fn build(
    config: &TunnelConfig,
    secrets: &ResolvedSecrets,
    opts: &BuildOptions,
) -> Result<LaunchPlan, TunnelError> {
    config.validate()?;

    let mut args: Vec<String> = vec![
        "-L".into(),
        config.forward().to_string(),
        config.destination(),
        "-p".into(),
        config.server_port.to_string(),
        "-N".into(),
    ];
    let mut rules = Vec::new();
    let mut stdin_file = None;
    let mut side_files = Vec::new();

    match config.auth_method {
        AuthMethod::Password => {
            if let Some(pw) = non_empty(&config.password) {
                rules.push(PromptRule::new(PASSWORD_PROMPT, PromptAction::WriteSecret(Secret::new(pw))));
            }
        }
        AuthMethod::PrivateKey => {
            if let Some(path) = &config.private_key_path {
                args.push("-i".into());
                args.push(path.display().to_string());
            }
            if let Some(pass) = non_empty(&config.private_key_passphrase) {
                rules.push(PromptRule::new(PASSPHRASE_PROMPT, PromptAction::WriteSecret(Secret::new(pass))));
            }
        }
        AuthMethod::Certificate => {
            if let Some(path) = &config.certificate_path {
                args.push("-o".into());
                args.push(format!("PKCS11Provider={}", path.display()));
            }
        }
        AuthMethod::KeyboardInteractive => {
            push_keyboard_interactive(&mut args);
            if let Some(pw) = non_empty(&config.password) {
                rules.push(PromptRule::new(PASSWORD_PROMPT, PromptAction::WriteSecret(Secret::new(pw))));
            }
            // With TOTP configured the code prompt is answered, not announced.
            if !config.use_totp {
                rules.push(PromptRule::new(
                    CODE_PROMPT,
                    PromptAction::Notify("ssh is asking for a one-time code; touch your YubiKey OTP slot".into()),
                ));
            }
        }
        AuthMethod::YubiKeyPiv => {
            if let Some(provider) = &config.yubikey_provider {
                args.push("-o".into());
                args.push(format!("PKCS11Provider={}", provider.display()));
            }
            match non_empty(&config.yubikey_pin) {
                Some(pin) => {
                    let file = side_file(&opts.side_file_dir, "pin", pin, opts.pin_file_ttl);
                    stdin_file = Some(file.path.clone());
                    side_files.push(file);
                }
                None => rules.push(PromptRule::new(
                    PIN_PROMPT,
                    PromptAction::Notify("ssh is asking for the YubiKey PIV PIN; set yubikey_pin for this tunnel".into()),
                )),
            }
        }
        AuthMethod::YubiKeyOath => {
            rules.push(PromptRule::new(
                VERIFICATION_PROMPT,
                PromptAction::OathCode {
                    account: config.yubikey_oath_account.clone(),
                },
            ));
        }
        AuthMethod::YubiKeyChallengeResponse => {
            push_keyboard_interactive(&mut args);
            rules.push(PromptRule::new(CHALLENGE_PROMPT, PromptAction::ChallengeResponse));
        }
    }

    if config.auth_method.needs_yubikey() {
        rules.push(PromptRule::new(
            PRESENCE_PROMPT,
            PromptAction::Notify("touch your YubiKey to confirm presence".into()),
        ));
    }

    if config.connection_timeout > 0 {
        args.push("-o".into());
        args.push(format!("ConnectTimeout={}", config.connection_timeout));
    }
    if config.keep_alive_interval > 0 {
        args.push("-o".into());
        args.push(format!("ServerAliveInterval={}", config.keep_alive_interval));
    }
    if config.compression {
        args.push("-C".into());
    }
    args.extend(config.extra_options.split_whitespace().map(String::from));

    if config.use_totp {
        let stdin_taken = stdin_file.is_some() || rules.iter().any(|r| r.action.writes_stdin());
        match (&secrets.totp_code, stdin_taken) {
            (Some(code), false) => {
                let file = side_file(&opts.side_file_dir, "totp", code, opts.totp_file_ttl);
                stdin_file = Some(file.path.clone());
                side_files.push(file);
            }
            _ if config.auth_method != AuthMethod::YubiKeyOath => {
                // validate() guarantees the secret is present
                let secret = non_empty(&config.totp_secret).unwrap_or_default();
                rules.push(PromptRule::new(
                    VERIFICATION_PROMPT,
                    PromptAction::Totp {
                        secret: Secret::new(secret),
                    },
                ));
            }
            _ => {}
        }
    }

    Ok(LaunchPlan {
        program: opts.program.clone(),
        args,
        stdin_file,
        side_files,
        rules,
    })
}

fn push_keyboard_interactive(args: &mut Vec<String>) {
    args.push("-o".into());
    args.push("PreferredAuthentications=keyboard-interactive".into());
}

fn side_file(dir: &Path, kind: &str, contents: &str, ttl: Duration) -> SideFile {
    SideFile {
        path: dir.join(format!("ferret-{}-{}", kind, uuid::Uuid::new_v4())),
        contents: Secret::new(contents),
        delete_after: ttl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TunnelConfig {
        TunnelConfig::new("web", "gw.example.com", "alice", 8080, "localhost", 80)
    }

    fn opts() -> BuildOptions {
        BuildOptions {
            side_file_dir: PathBuf::from("/tmp/ferret-test"),
            ..BuildOptions::default()
        }
    }

    fn plan(cfg: &TunnelConfig) -> LaunchPlan {
        build(cfg, &ResolvedSecrets::default(), &opts()).unwrap()
    }

    fn count(args: &[String], needle: &str) -> usize {
        args.iter().filter(|a| *a == needle).count()
    }

    fn position(args: &[String], needle: &str) -> usize {
        args.iter().position(|a| a == needle).unwrap()
    }

    #[test]
    fn base_clause_in_order() {
        let mut cfg = base();
        cfg.connection_timeout = 0;
        cfg.keep_alive_interval = 0;
        cfg.compression = false;
        let p = plan(&cfg);
        assert_eq!(p.program, "ssh");
        assert_eq!(
            p.args,
            ["-L", "8080:localhost:80", "alice@gw.example.com", "-p", "22", "-N"]
        );
    }

    #[test]
    fn forward_and_destination_once_in_every_method() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let methods = [
            AuthMethod::Password,
            AuthMethod::PrivateKey,
            AuthMethod::Certificate,
            AuthMethod::KeyboardInteractive,
            AuthMethod::YubiKeyPiv,
            AuthMethod::YubiKeyOath,
            AuthMethod::YubiKeyChallengeResponse,
        ];
        for method in methods {
            let mut cfg = base();
            cfg.auth_method = method;
            cfg.private_key_path = Some(key.path().to_path_buf());
            cfg.certificate_path = Some(PathBuf::from("/usr/lib/opensc-pkcs11.so"));
            cfg.extra_options = "-v -o StrictHostKeyChecking=no".into();
            let p = plan(&cfg);
            assert_eq!(count(&p.args, "-L"), 1, "{method}");
            assert_eq!(count(&p.args, "8080:localhost:80"), 1, "{method}");
            assert_eq!(count(&p.args, "alice@gw.example.com"), 1, "{method}");
            assert_eq!(position(&p.args, "-L") + 1, position(&p.args, "8080:localhost:80"));
            assert!(position(&p.args, "8080:localhost:80") < position(&p.args, "alice@gw.example.com"));
        }
    }

    #[test]
    fn default_options_appended() {
        let p = plan(&base());
        assert_eq!(
            &p.args[6..],
            ["-o", "ConnectTimeout=30", "-o", "ServerAliveInterval=60", "-C"]
        );
    }

    #[test]
    fn extra_options_split_into_argv() {
        let mut cfg = base();
        cfg.extra_options = "  -v   -o ExitOnForwardFailure=yes ".into();
        let p = plan(&cfg);
        assert_eq!(&p.args[p.args.len() - 3..], ["-v", "-o", "ExitOnForwardFailure=yes"]);
    }

    #[test]
    fn password_installs_prompt_rule() {
        let mut cfg = base();
        cfg.password = Some("secret".into());
        let p = plan(&cfg);
        assert_eq!(
            p.rules,
            vec![PromptRule::new("password", PromptAction::WriteSecret(Secret::new("secret")))]
        );
        assert!(p.side_files.is_empty());
        assert!(p.stdin_file.is_none());
    }

    #[test]
    fn private_key_path_and_passphrase() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let mut cfg = base();
        cfg.auth_method = AuthMethod::PrivateKey;
        cfg.private_key_path = Some(key.path().to_path_buf());
        cfg.private_key_passphrase = Some("pp".into());
        let p = plan(&cfg);
        let i = position(&p.args, "-i");
        assert_eq!(p.args[i + 1], key.path().display().to_string());
        assert!(!p.args.iter().any(|a| a.starts_with("PKCS11Provider")));
        assert_eq!(p.rules[0].pattern, "passphrase");
    }

    #[test]
    fn private_key_missing_is_config_invalid() {
        let mut cfg = base();
        cfg.auth_method = AuthMethod::PrivateKey;
        cfg.private_key_path = Some(PathBuf::from("/nonexistent/ferret/key"));
        let err = build(&cfg, &ResolvedSecrets::default(), &opts()).unwrap_err();
        assert_eq!(err.kind(), "config-invalid");
    }

    #[test]
    fn certificate_uses_pkcs11_provider() {
        let mut cfg = base();
        cfg.auth_method = AuthMethod::Certificate;
        cfg.certificate_path = Some(PathBuf::from("/usr/lib/opensc-pkcs11.so"));
        let p = plan(&cfg);
        assert!(p.args.contains(&"PKCS11Provider=/usr/lib/opensc-pkcs11.so".to_string()));
        assert_eq!(count(&p.args, "-i"), 0);
    }

    #[test]
    fn keyboard_interactive_preference() {
        let mut cfg = base();
        cfg.auth_method = AuthMethod::KeyboardInteractive;
        let p = plan(&cfg);
        assert!(p.args.contains(&"PreferredAuthentications=keyboard-interactive".to_string()));
        assert_eq!(p.rules.len(), 1);
        assert!(p.rules[0].matches("One-time code:"));
        assert!(matches!(p.rules[0].action, PromptAction::Notify(_)));
    }

    #[test]
    fn keyboard_interactive_with_totp_answers_code_prompt() {
        let mut cfg = base();
        cfg.auth_method = AuthMethod::KeyboardInteractive;
        cfg.password = Some("pw".into());
        cfg.use_totp = true;
        cfg.totp_secret = Some("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".into());
        let p = plan(&cfg);
        assert!(p.rules.iter().all(|r| !matches!(r.action, PromptAction::Notify(_))));
        assert!(p.rules.iter().any(|r| matches!(r.action, PromptAction::Totp { .. })));
    }

    #[test]
    fn piv_pin_becomes_stdin_side_file() {
        let mut cfg = base();
        cfg.auth_method = AuthMethod::YubiKeyPiv;
        cfg.yubikey_provider = Some(PathBuf::from("/usr/lib/libykcs11.so"));
        cfg.yubikey_pin = Some("123456".into());
        let p = plan(&cfg);
        assert!(p.args.contains(&"PKCS11Provider=/usr/lib/libykcs11.so".to_string()));
        assert_eq!(p.side_files.len(), 1);
        let file = &p.side_files[0];
        assert_eq!(file.contents.expose(), "123456");
        assert_eq!(file.delete_after, Duration::from_secs(5));
        assert!(file.path.starts_with("/tmp/ferret-test"));
        assert_eq!(p.stdin_file.as_ref(), Some(&file.path));
    }

    #[test]
    fn piv_without_pin_notifies() {
        let mut cfg = base();
        cfg.auth_method = AuthMethod::YubiKeyPiv;
        let p = plan(&cfg);
        assert!(p.side_files.is_empty());
        assert!(p.rules.iter().all(|r| !r.action.writes_stdin()));
    }

    #[test]
    fn oath_fetch_rule() {
        let mut cfg = base();
        cfg.auth_method = AuthMethod::YubiKeyOath;
        cfg.yubikey_oath_account = Some("corp:alice".into());
        let p = plan(&cfg);
        assert_eq!(
            p.rules[0],
            PromptRule::new(
                "Verification code",
                PromptAction::OathCode {
                    account: Some("corp:alice".into())
                }
            )
        );
    }

    #[test]
    fn challenge_response_rule() {
        let mut cfg = base();
        cfg.auth_method = AuthMethod::YubiKeyChallengeResponse;
        let p = plan(&cfg);
        assert!(p.args.contains(&"PreferredAuthentications=keyboard-interactive".to_string()));
        assert_eq!(p.rules[0].action, PromptAction::ChallengeResponse);
    }

    #[test]
    fn totp_file_when_stdin_is_free() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let mut cfg = base();
        cfg.auth_method = AuthMethod::PrivateKey;
        cfg.private_key_path = Some(key.path().to_path_buf());
        cfg.use_totp = true;
        cfg.totp_secret = Some("GEZDGNBVGY3TQOJQ".into());
        let secrets = ResolvedSecrets {
            totp_code: Some("654321".into()),
        };
        let p = build(&cfg, &secrets, &opts()).unwrap();
        assert_eq!(p.side_files.len(), 1);
        assert_eq!(p.side_files[0].contents.expose(), "654321");
        assert_eq!(p.side_files[0].delete_after, Duration::from_secs(30));
        assert_eq!(p.stdin_file.as_ref(), Some(&p.side_files[0].path));
    }

    #[test]
    fn totp_prompt_when_password_owns_stdin() {
        let mut cfg = base();
        cfg.password = Some("secret".into());
        cfg.use_totp = true;
        cfg.totp_secret = Some("GEZDGNBVGY3TQOJQ".into());
        let secrets = ResolvedSecrets {
            totp_code: Some("654321".into()),
        };
        let p = build(&cfg, &secrets, &opts()).unwrap();
        assert!(p.side_files.is_empty());
        assert!(p.stdin_file.is_none());
        assert!(p.rules.iter().any(|r| matches!(r.action, PromptAction::Totp { .. })));
    }

    #[test]
    fn invalid_config_produces_no_side_files() {
        let mut cfg = base();
        cfg.auth_method = AuthMethod::YubiKeyPiv;
        cfg.yubikey_pin = Some("123456".into());
        cfg.username.clear();
        assert!(build(&cfg, &ResolvedSecrets::default(), &opts()).is_err());
    }

    #[test]
    fn build_does_not_mutate_config() {
        let mut cfg = base();
        cfg.password = Some("secret".into());
        let before = cfg.clone();
        let _ = plan(&cfg);
        assert_eq!(cfg, before);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let mut cfg = base();
        cfg.password = Some("hunter2".into());
        let p = plan(&cfg);
        assert!(!format!("{:?}", p).contains("hunter2"));
    }

    #[test]
    fn rule_matching_is_case_insensitive() {
        let rule = PromptRule::new("password", PromptAction::Notify(String::new()));
        assert!(rule.matches("alice@gw.example.com's Password:"));
        assert!(!rule.matches("Welcome"));
    }

    #[test]
    fn display_command_quotes_spaces() {
        let p = LaunchPlan {
            program: "ssh".into(),
            args: vec!["-i".into(), "/keys/my key".into()],
            stdin_file: None,
            side_files: vec![],
            rules: vec![],
        };
        assert_eq!(p.display_command(), "ssh -i \"/keys/my key\"");
    }
}
