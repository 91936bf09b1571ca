use std::path::Path;

use dashling::Settings;

/// Reads session settings from a TOML file. Missing keys keep their defaults.
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Settings> {
    let data = std::fs::read_to_string(path)?;
    let settings = toml::from_str(&data)?;
    Ok(settings)
}
