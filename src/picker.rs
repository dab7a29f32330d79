use anyhow::{Context, Result};
use dialoguer::FuzzySelect;
use dialoguer::theme::ColorfulTheme;

use ferret::TunnelConfig;

/// Show a fuzzy picker over `tunnels` and return the chosen one.
pub fn pick_tunnel<'a>(prompt: &str, tunnels: &'a [TunnelConfig]) -> Result<&'a TunnelConfig> {
    if tunnels.is_empty() {
        anyhow::bail!("no tunnels configured");
    }

    let items: Vec<String> = tunnels
        .iter()
        .map(|t| format!("{} ({} via {})", t.name, t.forward(), t.server_host))
        .collect();

    let idx = FuzzySelect::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .interact()
        .context("selection cancelled")?;
    Ok(&tunnels[idx])
}
