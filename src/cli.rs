use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::engine::{ArgValueCompleter, CompletionCandidate};

use ferret::AuthMethod;
use ferret::config::Config;
use ferret::store;

#[derive(Parser)]
#[command(name = "ferret", about = "SSH tunnel supervisor", version)]
pub struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Enable debug logging (includes ssh output)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

fn complete_tunnel_names(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let prefix = current.to_str().unwrap_or("");
    let tunnels = Config::load()
        .tunnels_path()
        .and_then(|p| store::load_tunnels(&p))
        .unwrap_or_default();
    tunnels
        .iter()
        .filter(|t| t.name.starts_with(prefix))
        .map(|t| CompletionCandidate::new(&t.name))
        .collect()
}

#[derive(Subcommand)]
pub enum Command {
    /// Start tunnels and keep them running until Ctrl-C
    Up {
        /// Tunnel name (auto_connect or interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_tunnel_names))]
        name: Option<String>,
        /// Start every tunnel
        #[arg(long, short, conflicts_with = "name")]
        all: bool,
    },
    /// List all tunnels and whether their local port is listening
    #[command(alias = "ls", alias = "status")]
    List,
    /// Probe the local port of every tunnel
    Check,
    /// Add a new tunnel
    Add(AddArgs),
    /// Remove a tunnel
    Remove {
        /// Tunnel name (interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_tunnel_names))]
        name: Option<String>,
    },
    /// Open the tunnels file in your editor
    Edit,
    /// Show tunnel logs
    Logs {
        /// Tunnel name (interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_tunnel_names))]
        name: Option<String>,
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },
    /// Print the current TOTP code of a tunnel
    Totp {
        /// Tunnel name (interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_tunnel_names))]
        name: Option<String>,
    },
    /// Start all tunnels on login via launchd
    Enable,
    /// Stop starting tunnels on login
    Disable,
    /// Initialize or edit ~/.ferret/config.toml
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for (reads from config if omitted)
        shell: Option<clap_complete::Shell>,
    },
    /// List tunnel names (for shell completion scripts)
    #[command(hide = true)]
    ListTunnelNames,
}

#[derive(Args)]
pub struct AddArgs {
    /// Tunnel name
    pub name: String,
    /// SSH server host
    #[arg(long)]
    pub host: String,
    /// SSH user (defaults to the current user)
    #[arg(long, short)]
    pub user: Option<String>,
    /// SSH server port
    #[arg(long, short, default_value = "22")]
    pub port: u16,
    /// Local port to listen on
    #[arg(long, short = 'L')]
    pub local: u16,
    /// Host to forward to, as seen from the server
    #[arg(long, default_value = "localhost")]
    pub remote_host: String,
    /// Port to forward to
    #[arg(long, short = 'R')]
    pub remote_port: u16,
    /// Authentication method
    #[arg(long, short, value_enum, default_value_t = AuthMethod::Password)]
    pub auth: AuthMethod,
    /// Private key file (private-key)
    #[arg(long, short = 'i')]
    pub key: Option<PathBuf>,
    /// PKCS#11 provider for certificate authentication
    #[arg(long)]
    pub cert: Option<PathBuf>,
    /// PKCS#11 provider for YubiKey PIV
    #[arg(long)]
    pub provider: Option<PathBuf>,
    /// OATH account on the YubiKey (first account if omitted)
    #[arg(long)]
    pub oath_account: Option<String>,
    /// Base32 TOTP secret; enables TOTP answers
    #[arg(long)]
    pub totp_secret: Option<String>,
    /// Prompt for a password, passphrase or PIN to store with the tunnel
    #[arg(long)]
    pub ask_secret: bool,
    /// Extra ssh arguments, e.g. "-o ExitOnForwardFailure=yes"
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub extra: String,
    /// Disable ssh compression
    #[arg(long)]
    pub no_compression: bool,
}
