//! Watches a session's ssh output and answers authentication prompts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{PromptAction, PromptRule};
use crate::error::TunnelError;
use crate::process::StdinWriter;
use crate::totp;
use crate::yubikey::YubiKey;

const RECENT_LINES: usize = 50;

/// Bounded buffer of the most recent output lines of a session.
#[derive(Clone, Default)]
pub struct RecentLines(Arc<parking_lot::Mutex<VecDeque<String>>>);

impl RecentLines {
    pub fn push(&self, line: &str) {
        let mut lines = self.0.lock();
        if lines.len() == RECENT_LINES {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<String> {
        self.0.lock().back().cloned()
    }
}

type SharedStdin = Arc<Mutex<Option<StdinWriter>>>;

/// How the output loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// ssh closed its output, i.e. it exited on its own.
    EndOfStream,
    /// The session was torn down.
    Cancelled,
}

struct ArmedRule {
    rule: PromptRule,
    fired: bool,
}

pub struct Responder {
    tunnel: String,
    rules: Vec<ArmedRule>,
    stdin: SharedStdin,
    yubikey: Arc<dyn YubiKey>,
    fetch_timeout: Duration,
    cancel: CancellationToken,
    recent: RecentLines,
    log: Option<tokio::fs::File>,
}

impl Responder {
    pub fn new(
        tunnel: impl Into<String>,
        rules: Vec<PromptRule>,
        stdin: Option<StdinWriter>,
        yubikey: Arc<dyn YubiKey>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tunnel: tunnel.into(),
            rules: rules
                .into_iter()
                .map(|rule| ArmedRule { rule, fired: false })
                .collect(),
            stdin: Arc::new(Mutex::new(stdin)),
            yubikey,
            fetch_timeout: Duration::from_secs(60),
            cancel,
            recent: RecentLines::default(),
            log: None,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_recent(mut self, recent: RecentLines) -> Self {
        self.recent = recent;
        self
    }

    pub fn with_log(mut self, log: Option<tokio::fs::File>) -> Self {
        self.log = log;
        self
    }

    /// Consume output lines until ssh closes its streams or the session is cancelled.
    pub async fn run(mut self, mut output: mpsc::Receiver<String>) -> Ending {
        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ending::Cancelled,
                line = output.recv() => line,
            };
            match line {
                Some(line) => self.handle_line(&line).await,
                None => return Ending::EndOfStream,
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        debug!("[{}] {}", self.tunnel, line);
        self.recent.push(line);
        if let Some(log) = self.log.as_mut() {
            let mut entry = line.as_bytes().to_vec();
            entry.push(b'\n');
            let written = async {
                log.write_all(&entry).await?;
                log.flush().await
            }
            .await;
            if let Err(e) = written {
                warn!("[{}] failed to write log file: {}", self.tunnel, e);
                self.log = None;
            }
        }

        for idx in 0..self.rules.len() {
            let armed = &self.rules[idx];
            if armed.fired || !armed.rule.matches(line) {
                continue;
            }
            let action = armed.rule.action.clone();
            if self.dispatch(action, line).await {
                self.rules[idx].fired = true;
            }
        }
    }

    /// Returns false when the line did not carry enough to act on, leaving
    /// the rule armed for a later line.
    async fn dispatch(&self, action: PromptAction, line: &str) -> bool {
        match action {
            PromptAction::WriteSecret(secret) => {
                write_secret(&self.stdin, &self.tunnel, secret.expose(), "prompt answer").await;
            }
            PromptAction::Totp { secret } => match totp::current_code(secret.expose()) {
                Ok(code) => write_secret(&self.stdin, &self.tunnel, &code, "TOTP code").await,
                Err(e) => warn!("[{}] failed to generate TOTP code: {}", self.tunnel, e),
            },
            PromptAction::OathCode { account } => {
                self.spawn_fetch(Fetch::Oath(account));
            }
            PromptAction::ChallengeResponse => match extract_challenge(line) {
                Some(challenge) => self.spawn_fetch(Fetch::Challenge(challenge)),
                None => {
                    debug!("[{}] no challenge value in '{}', waiting", self.tunnel, line);
                    return false;
                }
            },
            PromptAction::Notify(message) => {
                warn!("[{}] {}", self.tunnel, message);
            }
        }
        true
    }

    fn spawn_fetch(&self, fetch: Fetch) {
        let tunnel = self.tunnel.clone();
        let stdin = self.stdin.clone();
        let yubikey = self.yubikey.clone();
        let cancel = self.cancel.clone();
        let timeout = self.fetch_timeout;

        info!("[{}] waiting for YubiKey, touch it if it blinks", tunnel);
        tokio::spawn(async move {
            let request = async {
                match &fetch {
                    Fetch::Oath(account) => yubikey.oath_code(account.as_deref()).await,
                    Fetch::Challenge(challenge) => yubikey.challenge_response(challenge).await,
                }
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[{}] YubiKey fetch abandoned, session closed", tunnel);
                    return;
                }
                outcome = tokio::time::timeout(timeout, request) => outcome,
            };

            let reason = match outcome {
                Ok(Ok(response)) => {
                    write_secret(&stdin, &tunnel, &response, fetch.label()).await;
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no response within {}s", timeout.as_secs()),
            };
            let err = TunnelError::FetchFailed {
                name: tunnel.clone(),
                reason,
            };
            warn!("{} [{}]", err, err.kind());
        });
    }
}

enum Fetch {
    Oath(Option<String>),
    Challenge(String),
}

impl Fetch {
    fn label(&self) -> &'static str {
        match self {
            Fetch::Oath(_) => "YubiKey OATH code",
            Fetch::Challenge(_) => "YubiKey challenge-response",
        }
    }
}

async fn write_secret(stdin: &SharedStdin, tunnel: &str, secret: &str, label: &str) {
    let mut guard = stdin.lock().await;
    let Some(writer) = guard.as_mut() else {
        warn!("[{}] cannot send {}: stdin is redirected from a file", tunnel, label);
        return;
    };
    let mut payload = secret.as_bytes().to_vec();
    payload.push(b'\n');
    let result = async {
        writer.write_all(&payload).await?;
        writer.flush().await
    }
    .await;
    match result {
        Ok(()) => info!("[{}] sent {}", tunnel, label),
        Err(e) => warn!("[{}] failed to send {}: {}", tunnel, label, e),
    }
}

/// Pull the challenge value out of a prompt line.
///
/// `Challenge: 4f2a9c` yields `4f2a9c`; `YubiKey challenge 4f2a9c, respond:`
/// yields the token after the word "challenge" when it looks like an
/// encoded value rather than prose.
pub fn extract_challenge(line: &str) -> Option<String> {
    if let Some((_, after)) = line.rsplit_once(':') {
        let after = after.trim();
        if !after.is_empty() {
            return Some(after.to_string());
        }
    }

    let mut tokens = line.split_whitespace();
    tokens.find(|t| t.trim_end_matches(':').eq_ignore_ascii_case("challenge"))?;
    let value = tokens.next()?.trim_end_matches([',', ':', ';', '.']);
    looks_encoded(value).then(|| value.to_string())
}

// Hex or base64 with at least one digit, so words like "below" are rejected.
fn looks_encoded(token: &str) -> bool {
    token.len() >= 4
        && token.chars().any(|c| c.is_ascii_digit())
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
}
