//! Configuration loading and resolution.

use std::path::Path;

use anyhow::{Context, Result};
use listing_harvest::HarvestConfig;

/// Environment variable overriding the store location.
pub const OUTPUT_ENV: &str = "LISTING_HARVEST_OUTPUT";

pub const DEFAULT_OUTPUT: &str = "./Car Models/listing_urls.csv";
pub const DEFAULT_TARGETS: &str = "./Car Models/cars.csv";

/// Resolve the listing store path.
pub fn resolve_output_path(explicit: Option<&str>) -> String {
    if let Some(path) = explicit {
        return path.to_string();
    }

    if let Ok(env_path) = std::env::var(OUTPUT_ENV) {
        if !env_path.trim().is_empty() {
            return env_path;
        }
    }

    DEFAULT_OUTPUT.to_string()
}

/// Load a JSON config file, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<HarvestConfig> {
    let Some(path) = path else {
        return Ok(HarvestConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    HarvestConfig::from_json(&text).with_context(|| format!("invalid config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_output_wins() {
        assert_eq!(resolve_output_path(Some("/tmp/out.csv")), "/tmp/out.csv");
    }

    #[test]
    fn test_missing_config_path_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config, HarvestConfig::default());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_pages": 5, "max_idle_epochs": 2}}"#).unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.max_pages, 5);
        assert_eq!(config.max_idle_epochs, 2);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_harvest_buffer": 0}}"#).unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("max_harvest_buffer"));
    }
}
