use colored::Colorize;
use console::Alignment;

use ferret::TunnelConfig;

/// Print a formatted list of tunnels. `listening[i]` tells whether the local
/// port of `tunnels[i]` currently accepts connections.
pub fn print_tunnel_list(tunnels: &[TunnelConfig], listening: &[bool]) {
    if tunnels.is_empty() {
        println!("{}", "No tunnels configured".yellow());
        println!("Run `ferret add <name> --host <server> -L <local> -R <remote>` to get started.");
        return;
    }

    let rows: Vec<Row> = tunnels
        .iter()
        .zip(listening)
        .map(|(t, &up)| Row {
            name: t.name.clone(),
            up,
            forward: t.forward().to_string(),
            server: format!("{}:{}", t.destination(), t.server_port),
            auth: if t.use_totp {
                format!("{}+totp", t.auth_method)
            } else {
                t.auth_method.to_string()
            },
        })
        .collect();

    let w_name = rows.iter().map(|r| r.name.len()).max().unwrap_or(0);
    let w_fwd = rows.iter().map(|r| r.forward.len()).max().unwrap_or(0);
    let w_server = rows.iter().map(|r| r.server.len()).max().unwrap_or(0);

    for row in &rows {
        let (bullet, name) = if row.up {
            ("●".green().to_string(), row.name.green().bold().to_string())
        } else {
            ("○".dimmed().to_string(), row.name.to_string())
        };
        println!(
            "  {} {}  {}  {}  {}",
            bullet,
            pad(&name, w_name),
            pad(&row.forward, w_fwd),
            pad(&row.server.dimmed().to_string(), w_server),
            row.auth.dimmed()
        );
    }
}

/// Print one line per port probe result of `ferret check`.
pub fn print_check_line(name: &str, port: u16, ok: bool) {
    let icon = if ok {
        "✓".green().to_string()
    } else {
        "✗".red().to_string()
    };
    println!("  {} {:<20}  :{}", icon, name.bold(), port);
}

/// Pad an ANSI-colored string to a visible width using console's awareness of escape codes.
fn pad(s: &str, width: usize) -> String {
    console::pad_str(s, width, Alignment::Left, None).to_string()
}

struct Row {
    name: String,
    up: bool,
    forward: String,
    server: String,
    auth: String,
}
