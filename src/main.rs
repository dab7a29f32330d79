mod cli;
mod display;
mod launchd;
mod picker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::Colorize;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use cli::{AddArgs, Cli, Command};
use ferret::config::Config;
use ferret::process::{self, SshLauncher};
use ferret::yubikey::Ykman;
use ferret::{AuthMethod, SessionInfo, Supervisor, TunnelConfig, health, store, totp};

#[tokio::main]
async fn main() -> Result<()> {
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();

    let cli = Cli::parse();
    let cfg = Config::load();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(!cli.no_color)
        .init();

    match cli.command {
        Command::Up { name, all } => cmd_up(name, all, &cfg).await,
        Command::List => cmd_list(&cfg).await,
        Command::Check => cmd_check(&cfg).await,
        Command::Add(args) => cmd_add(args, &cfg),
        Command::Remove { name } => cmd_remove(name, &cfg),
        Command::Edit => cmd_edit(&cfg),
        Command::Logs {
            name,
            lines,
            follow,
        } => cmd_logs(name, lines, follow, &cfg),
        Command::Totp { name } => cmd_totp(name, &cfg),
        Command::Enable => cmd_enable(),
        Command::Disable => cmd_disable(),
        Command::Config => cmd_config(&cfg),
        Command::Completions { shell } => cmd_completions(shell, &cfg),
        Command::ListTunnelNames => cmd_list_tunnel_names(&cfg),
    }
}

fn load_tunnels(cfg: &Config) -> Result<(PathBuf, Vec<TunnelConfig>)> {
    let path = cfg.tunnels_path()?;
    let tunnels = store::load_tunnels(&path)?;
    Ok((path, tunnels))
}

fn find_or_pick<'a>(
    tunnels: &'a [TunnelConfig],
    name: Option<&str>,
    prompt: &str,
) -> Result<&'a TunnelConfig> {
    match name {
        Some(n) => tunnels
            .iter()
            .find(|t| t.name == n)
            .ok_or_else(|| anyhow::anyhow!("no tunnel named '{}'", n)),
        None => picker::pick_tunnel(prompt, tunnels),
    }
}

async fn print_start_status(info: &SessionInfo, cfg: &Config) {
    let timeout = Duration::from_secs(cfg.health_timeout);
    let healthy = health::wait_healthy_ports(&[info.port], timeout).await;
    let health_msg = if healthy {
        format!("{} healthy", "✓".green())
    } else {
        format!("{} port not reachable yet", "✗".yellow())
    };
    let pid = info.pid.map_or_else(|| "?".to_string(), |p| p.to_string());
    println!(
        "{} {} {} on :{} (pid {}), {}",
        "●".green(),
        info.name.green().bold(),
        "started".green(),
        info.port,
        pid,
        health_msg
    );
}

fn print_failure(name: &str, err: &dyn std::fmt::Display) {
    println!("{} {}: {}", "✗".red(), name.red().bold(), err);
}

async fn cmd_up(name: Option<String>, all: bool, cfg: &Config) -> Result<()> {
    let (_, tunnels) = load_tunnels(cfg)?;
    if tunnels.is_empty() {
        println!("{}", "No tunnels configured.".yellow());
        return Ok(());
    }

    let supervisor = Supervisor::new(
        Arc::new(SshLauncher),
        Arc::new(Ykman::new(cfg.ykman_program.clone())),
        cfg.supervisor_options()?,
    );
    for t in &tunnels {
        if let Err(e) = supervisor.add_config(t.clone()) {
            print_failure(&t.name, &e);
        }
    }

    if all || (name.is_none() && cfg.auto_connect) {
        let summary = supervisor.activate_all().await;
        if !summary.is_clean() {
            for (name, err) in &summary.failed {
                print_failure(name, err);
            }
            println!("{}", summary.to_string().yellow());
        }
    } else {
        let tunnel = find_or_pick(&tunnels, name.as_deref(), "Start tunnel")?;
        if let Err(e) = supervisor.activate(tunnel).await {
            print_failure(&tunnel.name, &e);
        }
    }

    let sessions = supervisor.active_sessions();
    if sessions.is_empty() {
        supervisor.shutdown().await;
        anyhow::bail!("no tunnel could be started");
    }
    for info in &sessions {
        print_start_status(info, cfg).await;
    }
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    let all_ended = async {
        while !supervisor.active_sessions().is_empty() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    };
    tokio::select! {
        signal = shutdown_signal() => {
            tracing::info!("received {}, stopping tunnels", signal?);
        }
        _ = all_ended => println!("{}", "All tunnels have exited.".yellow()),
    }

    let running = supervisor.active_sessions();
    supervisor.shutdown().await;
    for info in &running {
        println!(
            "{} {} {} after {}",
            "○".dimmed(),
            info.name.bold(),
            "stopped".dimmed(),
            process::format_uptime(info.started_at)
        );
    }
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM as sent by `launchctl unload` and logout.
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for Ctrl-C")?;
                Ok("SIGINT")
            }
            _ = term.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
        Ok("Ctrl-C")
    }
}

async fn probe_all(tunnels: &[TunnelConfig]) -> Vec<bool> {
    let mut listening = Vec::with_capacity(tunnels.len());
    for t in tunnels {
        listening.push(health::check_port(t.local_port).await);
    }
    listening
}

async fn cmd_list(cfg: &Config) -> Result<()> {
    let (_, tunnels) = load_tunnels(cfg)?;
    let listening = probe_all(&tunnels).await;
    display::print_tunnel_list(&tunnels, &listening);
    if launchd::is_enabled() {
        println!();
        println!("  {} starts on login", "⏎".green());
    }
    Ok(())
}

async fn cmd_check(cfg: &Config) -> Result<()> {
    let (_, tunnels) = load_tunnels(cfg)?;
    if tunnels.is_empty() {
        println!("{}", "No tunnels to check.".yellow());
        return Ok(());
    }

    let listening = probe_all(&tunnels).await;
    for (t, &ok) in tunnels.iter().zip(&listening) {
        display::print_check_line(&t.name, t.local_port, ok);
    }

    let healthy = listening.iter().filter(|&&ok| ok).count();
    println!();
    if healthy == tunnels.len() {
        println!("  {} All {} port(s) listening", "✓".green(), healthy);
    } else {
        println!(
            "  {} {}/{} port(s) listening",
            "✗".yellow(),
            healthy,
            tunnels.len()
        );
    }
    Ok(())
}

fn cmd_add(args: AddArgs, cfg: &Config) -> Result<()> {
    let (path, mut tunnels) = load_tunnels(cfg)?;
    if tunnels.iter().any(|t| t.name == args.name) {
        anyhow::bail!("tunnel '{}' already exists", args.name);
    }

    let user = args.user.unwrap_or_else(whoami::username);
    let mut tunnel = TunnelConfig::new(
        args.name,
        args.host,
        user,
        args.local,
        args.remote_host,
        args.remote_port,
    );
    tunnel.server_port = args.port;
    tunnel.auth_method = args.auth;
    tunnel.private_key_path = args.key;
    tunnel.certificate_path = args.cert;
    tunnel.yubikey_provider = args.provider;
    tunnel.yubikey_oath_account = args.oath_account;
    tunnel.use_totp = args.totp_secret.is_some();
    tunnel.totp_secret = args.totp_secret;
    tunnel.extra_options = args.extra;
    tunnel.compression = !args.no_compression;

    if args.ask_secret {
        let (label, slot) = match tunnel.auth_method {
            AuthMethod::PrivateKey => ("Key passphrase", &mut tunnel.private_key_passphrase),
            AuthMethod::YubiKeyPiv => ("YubiKey PIN", &mut tunnel.yubikey_pin),
            _ => ("Password", &mut tunnel.password),
        };
        let secret = dialoguer::Password::new()
            .with_prompt(label)
            .interact()
            .context("failed to read secret")?;
        *slot = Some(secret);
    }

    tunnel.validate()?;
    let summary = format!("{} via {}", tunnel.forward(), tunnel.destination());
    let name = tunnel.name.clone();
    tunnels.push(tunnel);
    store::save_tunnels(&path, &tunnels)?;

    println!(
        "{} {} added ({})",
        "✓".green(),
        name.green().bold(),
        summary.dimmed()
    );
    Ok(())
}

fn cmd_remove(name: Option<String>, cfg: &Config) -> Result<()> {
    let (path, mut tunnels) = load_tunnels(cfg)?;
    let target = find_or_pick(&tunnels, name.as_deref(), "Remove tunnel")?.name.clone();

    let confirmed = dialoguer::Confirm::new()
        .with_prompt(format!("Remove {}?", target))
        .default(false)
        .interact()
        .context("failed to read confirmation")?;

    if !confirmed {
        println!("Cancelled.");
        return Ok(());
    }

    tunnels.retain(|t| t.name != target);
    store::save_tunnels(&path, &tunnels)?;
    process::cleanup_logs(&process::log_dir()?, &target);

    println!(
        "{} {} removed from {}",
        "✓".green(),
        target.green().bold(),
        path.display()
    );
    Ok(())
}

fn open_in_editor(cfg: &Config, path: &std::path::Path) -> Result<()> {
    let editor = cfg.resolve_editor();

    let status = std::process::Command::new(&editor)
        .arg(path)
        .status()
        .with_context(|| format!("failed to launch editor '{}'", editor))?;

    if !status.success() {
        anyhow::bail!("editor exited with {}", status);
    }

    Ok(())
}

fn cmd_edit(cfg: &Config) -> Result<()> {
    let path = cfg.tunnels_path()?;
    open_in_editor(cfg, &path)?;
    // Surface syntax errors right away rather than at the next `up`.
    let tunnels = store::load_tunnels(&path)?;
    println!("{} {} tunnel(s) in {}", "✓".green(), tunnels.len(), path.display());
    Ok(())
}

fn cmd_logs(name: Option<String>, lines: usize, follow: bool, cfg: &Config) -> Result<()> {
    let (_, tunnels) = load_tunnels(cfg)?;
    let tunnel = find_or_pick(&tunnels, name.as_deref(), "Show logs for")?;

    let log_path = process::log_file(&process::log_dir()?, &tunnel.name);

    if !log_path.exists() {
        println!("{} No log file for '{}'", "⚠".yellow(), tunnel.name);
        return Ok(());
    }

    if log_path.metadata().map(|m| m.len()).unwrap_or(0) == 0 && !follow {
        println!("{} Log is empty", "✓".green());
        return Ok(());
    }

    let mut args = vec![format!("-n{}", lines)];
    if follow {
        args.push("-f".to_string());
    }
    args.push(log_path.to_string_lossy().to_string());

    let status = std::process::Command::new("tail")
        .args(&args)
        .status()
        .context("failed to run tail")?;

    if !status.success() {
        anyhow::bail!("tail exited with {}", status);
    }

    Ok(())
}

fn cmd_totp(name: Option<String>, cfg: &Config) -> Result<()> {
    let (_, tunnels) = load_tunnels(cfg)?;
    let with_totp: Vec<TunnelConfig> = tunnels.into_iter().filter(|t| t.use_totp).collect();
    let tunnel = find_or_pick(&with_totp, name.as_deref(), "TOTP code for")?;
    let secret = tunnel
        .totp_secret
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("tunnel '{}' has no TOTP secret", tunnel.name))?;

    let now = totp::now();
    let code = totp::generate_totp(secret, now)
        .with_context(|| format!("invalid TOTP secret for '{}'", tunnel.name))?;
    println!(
        "{}  {}",
        code.green().bold(),
        format!("{}s left", totp::seconds_remaining(now)).dimmed()
    );
    Ok(())
}

fn cmd_enable() -> Result<()> {
    if launchd::is_enabled() {
        println!("{}", "Auto-start is already enabled.".yellow());
        return Ok(());
    }
    launchd::enable()?;
    println!("{} auto-start {}", "⏎".green(), "enabled".green());
    Ok(())
}

fn cmd_disable() -> Result<()> {
    launchd::disable()?;
    println!("{} auto-start {}", "○".dimmed(), "disabled".dimmed());
    Ok(())
}

fn cmd_config(cfg: &Config) -> Result<()> {
    let path = Config::init()?;
    open_in_editor(cfg, &path)
}

fn cmd_completions(shell: Option<clap_complete::Shell>, cfg: &Config) -> Result<()> {
    let shell = match shell {
        Some(s) => s,
        None => {
            let name = cfg.shell.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "no shell specified; use `ferret completions <shell>` or set `shell` in ~/.ferret/config.toml"
                )
            })?;
            name.parse::<clap_complete::Shell>()
                .map_err(|_| anyhow::anyhow!("unknown shell '{}' in config", name))?
        }
    };

    let shell_name = match shell {
        clap_complete::Shell::Bash => "bash",
        clap_complete::Shell::Zsh => "zsh",
        clap_complete::Shell::Fish => "fish",
        clap_complete::Shell::Elvish => "elvish",
        clap_complete::Shell::PowerShell => "powershell",
        _ => anyhow::bail!("unsupported shell"),
    };
    unsafe { std::env::set_var("COMPLETE", shell_name) };
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    Ok(())
}

fn cmd_list_tunnel_names(cfg: &Config) -> Result<()> {
    let (_, tunnels) = load_tunnels(cfg)?;
    for t in &tunnels {
        println!("{}", t.name);
    }
    Ok(())
}
