use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::command::LaunchPlan;

pub type StdinWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A launched ssh process as seen by the supervisor.
pub struct SpawnedProcess {
    pub handle: Box<dyn ProcessHandle>,
    /// stdout and stderr lines, merged. Closes when both streams hit EOF.
    pub output: mpsc::Receiver<String>,
    /// `None` when stdin was redirected from a side file.
    pub stdin: Option<StdinWriter>,
}

#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;
    fn has_exited(&mut self) -> bool;
    /// Forcibly terminate and reap the process.
    async fn kill(&mut self) -> io::Result<()>;
    /// Wait for exit; returns the exit code when there is one.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, plan: &LaunchPlan) -> io::Result<SpawnedProcess>;
}

/// Launches the plan's program directly, without a shell.
#[derive(Debug, Default, Clone)]
pub struct SshLauncher;

#[async_trait]
impl Launcher for SshLauncher {
    async fn launch(&self, plan: &LaunchPlan) -> io::Result<SpawnedProcess> {
        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &plan.stdin_file {
            Some(path) => {
                let file = fs::File::open(path)?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::piped());
            }
        }

        let mut child = cmd.spawn()?;
        debug!("spawned {} (pid {:?})", plan.program, child.id());

        let (tx, rx) = mpsc::channel(256);
        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump_lines(out, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump_lines(err, tx));
        }
        let stdin = child.stdin.take().map(|s| Box::new(s) as StdinWriter);

        Ok(SpawnedProcess {
            handle: Box::new(ChildHandle { child }),
            output: rx,
            stdin,
        })
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    if let Some(rest) = splitter.finish() {
        let _ = tx.send(rest).await;
    }
}

/// Splits a byte stream into lines.
///
/// Prompts such as `alice@host's password: ` are printed without a newline,
/// so a trailing fragment that ends like a prompt is released immediately
/// instead of waiting for a line break that never comes.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(self.take());
                }
            } else {
                self.pending.push(b);
            }
        }
        if self.looks_like_prompt() {
            lines.push(self.take());
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn looks_like_prompt(&self) -> bool {
        let text = String::from_utf8_lossy(&self.pending);
        let trimmed = text.trim_end();
        trimmed.ends_with(':') || trimmed.ends_with('?')
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}

/// Directory where ferret keeps its state.
pub fn state_dir() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .context("cannot determine home directory")?
        .join(".ferret");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Directory where tunnel log files are stored.
pub fn log_dir() -> Result<PathBuf> {
    let dir = state_dir()?.join("logs");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Path to the log file for a specific tunnel.
pub fn log_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.log", name))
}

/// If a log file exceeds max_bytes, rename it to .log.old (replacing any
/// previous .old file) so the new run starts with a fresh log.
pub fn rotate_log(path: &Path, max_bytes: u64) {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() > max_bytes {
            let mut old = path.to_path_buf();
            old.set_extension("log.old");
            let _ = fs::rename(path, old);
        }
    }
}

/// Remove a tunnel's log files.
pub fn cleanup_logs(dir: &Path, name: &str) {
    let log = log_file(dir, name);
    let _ = fs::remove_file(&log);
    let mut log_old = log.clone();
    log_old.set_extension("log.old");
    let _ = fs::remove_file(&log_old);
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Format a duration as a human-readable string like "2h 14m" or "3d 1h".
pub fn format_uptime(start_epoch: u64) -> String {
    let elapsed = unix_now().saturating_sub(start_epoch);

    let days = elapsed / 86400;
    let hours = (elapsed % 86400) / 3600;
    let minutes = (elapsed % 3600) / 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn splitter_splits_lines() {
        let mut s = LineSplitter::default();
        assert_eq!(s.push(b"Warning: one\nsecond line\r\nthi"), ["Warning: one", "second line"]);
        assert_eq!(s.push(b"rd\n"), ["third"]);
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn splitter_releases_prompts_without_newline() {
        let mut s = LineSplitter::default();
        assert_eq!(s.push(b"alice@gw's password: "), ["alice@gw's password: "]);
        assert_eq!(s.push(b"Are you sure you want to continue connecting (yes/no)?"), [
            "Are you sure you want to continue connecting (yes/no)?"
        ]);
    }

    #[test]
    fn splitter_keeps_partial_text() {
        let mut s = LineSplitter::default();
        assert!(s.push(b"debug1: Connec").is_empty());
        assert_eq!(s.finish().as_deref(), Some("debug1: Connec"));
    }

    #[test]
    fn rotate_log_moves_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_file(dir.path(), "web");
        fs::write(&log, "x".repeat(64)).unwrap();
        rotate_log(&log, 16);
        assert!(!log.exists());
        assert!(dir.path().join("web.log.old").exists());
    }

    #[test]
    fn rotate_log_keeps_small_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_file(dir.path(), "web");
        fs::write(&log, "ok").unwrap();
        rotate_log(&log, 1024);
        assert!(log.exists());
    }

    #[test]
    fn format_uptime_minutes() {
        assert_eq!(format_uptime(unix_now() - 120), "2m");
    }

    #[test]
    fn format_uptime_hours() {
        assert_eq!(format_uptime(unix_now() - 7200), "2h 0m");
    }

    #[test]
    fn format_uptime_days() {
        assert_eq!(format_uptime(unix_now() - 90000), "1d 1h");
    }

    #[tokio::test]
    async fn pump_merges_until_eof() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(8);
        let pump = tokio::spawn(pump_lines(reader, tx));
        writer.write_all(b"banner\npassword: ").await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("banner"));
        assert_eq!(rx.recv().await.as_deref(), Some("password: "));
        drop(writer);
        pump.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launcher_reports_missing_binary() {
        let plan = LaunchPlan {
            program: "/nonexistent/ferret-ssh".into(),
            args: vec![],
            stdin_file: None,
            side_files: vec![],
            rules: vec![],
        };
        let err = SshLauncher.launch(&plan).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launcher_streams_output_and_stdin() {
        let plan = LaunchPlan {
            program: "sh".into(),
            args: vec!["-c".into(), "printf 'password: '; read pw; echo got $pw".into()],
            stdin_file: None,
            side_files: vec![],
            rules: vec![],
        };
        let mut spawned = SshLauncher.launch(&plan).await.unwrap();
        assert_eq!(spawned.output.recv().await.as_deref(), Some("password: "));
        let mut stdin = spawned.stdin.take().unwrap();
        stdin.write_all(b"hunter2\n").await.unwrap();
        stdin.flush().await.unwrap();
        assert_eq!(spawned.output.recv().await.as_deref(), Some("got hunter2"));
        assert_eq!(spawned.handle.wait().await.unwrap(), Some(0));
        assert!(spawned.handle.has_exited());
    }
}
