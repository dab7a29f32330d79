//! Test doubles for the launcher, the ssh process and the YubiKey.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::command::LaunchPlan;
use crate::process::{Launcher, ProcessHandle, SpawnedProcess, StdinWriter};
use crate::yubikey::{YubiKey, YubiKeyError};

/// Poll `check` for up to two seconds.
pub async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Captures everything written to a process's stdin.
#[derive(Clone, Default)]
pub struct SpyStdin(Arc<Mutex<Vec<u8>>>);

impl SpyStdin {
    pub fn writer(&self) -> StdinWriter {
        Box::new(SpyWriter(self.0.clone()))
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

struct SpyWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for SpyWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Test-side view of a process started by [`SpyLauncher`].
#[derive(Clone)]
pub struct SpyProcess {
    pub plan: LaunchPlan,
    /// Contents of the plan's stdin file at launch time.
    pub stdin_file_contents: Option<String>,
    pub stdin: SpyStdin,
    output: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    exited: Arc<AtomicBool>,
    code: Arc<AtomicI32>,
    kills: Arc<AtomicUsize>,
}

impl SpyProcess {
    /// Print a line on the process's output.
    pub async fn emit(&self, line: &str) {
        let tx = self.output.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(line.to_string()).await;
        }
    }

    /// Make the process exit on its own with `code`.
    pub fn exit(&self, code: i32) {
        self.code.store(code, Ordering::SeqCst);
        self.exited.store(true, Ordering::SeqCst);
        self.output.lock().take();
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }
}

struct SpyHandle {
    pid: u32,
    output: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    exited: Arc<AtomicBool>,
    code: Arc<AtomicI32>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessHandle for SpyHandle {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.code.store(-9, Ordering::SeqCst);
        self.exited.store(true, Ordering::SeqCst);
        self.output.lock().take();
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        while !self.exited.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(Some(self.code.load(Ordering::SeqCst)))
    }
}

/// Records launch plans instead of running ssh.
#[derive(Clone, Default)]
pub struct SpyLauncher {
    processes: Arc<Mutex<Vec<SpyProcess>>>,
    delay: Option<Duration>,
    fail: bool,
    next_pid: Arc<AtomicU32>,
}

impl SpyLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before returning from every launch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every launch as if the ssh binary were missing.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn processes(&self) -> Vec<SpyProcess> {
        self.processes.lock().clone()
    }

    pub fn last(&self) -> SpyProcess {
        self.processes.lock().last().cloned().expect("nothing launched")
    }
}

#[async_trait]
impl Launcher for SpyLauncher {
    async fn launch(&self, plan: &LaunchPlan) -> io::Result<SpawnedProcess> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::NotFound, "ssh: not found"));
        }

        let (tx, rx) = mpsc::channel(64);
        let stdin = SpyStdin::default();
        let process = SpyProcess {
            plan: plan.clone(),
            stdin_file_contents: plan
                .stdin_file
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok()),
            stdin: stdin.clone(),
            output: Arc::new(Mutex::new(Some(tx))),
            exited: Arc::new(AtomicBool::new(false)),
            code: Arc::new(AtomicI32::new(0)),
            kills: Arc::new(AtomicUsize::new(0)),
        };
        let handle = SpyHandle {
            pid: 4000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            output: process.output.clone(),
            exited: process.exited.clone(),
            code: process.code.clone(),
            kills: process.kills.clone(),
        };
        self.processes.lock().push(process);

        Ok(SpawnedProcess {
            handle: Box::new(handle),
            output: rx,
            stdin: plan.stdin_file.is_none().then(|| stdin.writer()),
        })
    }
}

/// Scripted YubiKey.
#[derive(Clone, Default)]
pub struct FakeYubiKey {
    present: bool,
    oath: Option<String>,
    challenge_prefix: Option<String>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FakeYubiKey {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn present() -> Self {
        Self {
            present: true,
            ..Self::default()
        }
    }

    pub fn with_oath(mut self, code: &str) -> Self {
        self.oath = Some(code.to_string());
        self
    }

    /// Challenge responses are `prefix + challenge`.
    pub fn with_challenge_prefix(mut self, prefix: &str) -> Self {
        self.challenge_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl YubiKey for FakeYubiKey {
    async fn is_present(&self) -> bool {
        self.present
    }

    async fn oath_code(&self, _account: Option<&str>) -> Result<String, YubiKeyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.oath.clone().ok_or(YubiKeyError::NoCode)
    }

    async fn challenge_response(&self, challenge: &str) -> Result<String, YubiKeyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.challenge_prefix
            .as_ref()
            .map(|p| format!("{}{}", p, challenge))
            .ok_or(YubiKeyError::EmptyResponse)
    }
}
