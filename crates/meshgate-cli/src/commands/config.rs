//! `meshgate config`

use anyhow::{Context, Result};
use meshgate_core::MeshConfig;

use crate::args::ConfigAction;

pub fn execute(config: &MeshConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { toml } => {
            println!("{}", render(config, toml)?);
        }
        ConfigAction::Validate => {
            config.validate()?;
            println!("Configuration is valid");
        }
    }
    Ok(())
}

fn render(config: &MeshConfig, as_toml: bool) -> Result<String> {
    if as_toml {
        toml::to_string_pretty(config).context("failed to render TOML")
    } else {
        serde_json::to_string_pretty(config).context("failed to render JSON")
    }
}
