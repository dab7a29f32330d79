use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use ferret::process;

const LABEL: &str = "com.ferret.agent";

fn launch_agents_dir() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .context("cannot determine home directory")?
        .join("Library")
        .join("LaunchAgents");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Path to the launchd plist that starts ferret on login.
pub fn plist_path() -> Result<PathBuf> {
    Ok(launch_agents_dir()?.join(format!("{}.plist", LABEL)))
}

/// Check if the login agent is installed.
pub fn is_enabled() -> bool {
    plist_path().map(|p| p.exists()).unwrap_or(false)
}

/// Kept outside `logs/` so it never collides with a tunnel's log.
fn agent_log(state_dir: &Path) -> PathBuf {
    state_dir.join("ferret-agent.log")
}

fn render_plist(program: &Path, log: &Path) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{program}</string>
        <string>up</string>
        <string>--all</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>StandardErrorPath</key>
    <string>{log}</string>
    <key>StandardOutPath</key>
    <string>{log}</string>
</dict>
</plist>"#,
        label = LABEL,
        program = program.display(),
        log = log.display(),
    )
}

/// Install and load a launchd agent running `ferret up --all` on login.
pub fn enable() -> Result<()> {
    let program = std::env::current_exe().context("cannot locate the ferret binary")?;
    let log_path = agent_log(&process::state_dir()?);
    let path = plist_path()?;

    fs::write(&path, render_plist(&program, &log_path))
        .with_context(|| format!("failed to write {}", path.display()))?;

    Command::new("launchctl")
        .args(["load", &path.to_string_lossy()])
        .status()
        .context("failed to run launchctl load")?;

    Ok(())
}

/// Unload and remove the login agent.
pub fn disable() -> Result<()> {
    let path = plist_path()?;
    if !path.exists() {
        anyhow::bail!("ferret is not enabled for auto-start");
    }

    Command::new("launchctl")
        .args(["unload", &path.to_string_lossy()])
        .status()
        .context("failed to run launchctl unload")?;

    fs::remove_file(&path)
        .with_context(|| format!("failed to remove {}", path.display()))?;

    Ok(())
}
