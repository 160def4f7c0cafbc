//! Configuration commands

use anyhow::{Context, Result};

use crate::config::settings::Settings;

pub fn example() -> Result<()> {
    print!("{}", Settings::example_config());
    Ok(())
}

/// Print the effective settings after file and flag overrides
pub fn show(settings: &Settings) -> Result<()> {
    let rendered = toml::to_string_pretty(settings).context("Failed to render settings")?;
    print!("{}", rendered);
    Ok(())
}
