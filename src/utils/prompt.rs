//! Confirmation prompts for destructive cluster operations

use anyhow::{Result, bail};
use dialoguer::Confirm;
use std::io::IsTerminal;

/// Ask for yes/no confirmation, defaulting to no.
///
/// Without a terminal there is nobody to ask, so the caller has to pass
/// `--yes` explicitly.
pub fn confirm(prompt: &str) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        bail!("{} (stdin is not a terminal; pass --yes to confirm)", prompt);
    }

    let result = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(result)
}
