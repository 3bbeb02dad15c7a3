//! Make/model target list.

use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One make/model pair to crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "Make")]
    pub make: String,
    #[serde(rename = "Model")]
    pub model: String,
}

/// Read targets from a CSV file with `Make` and `Model` columns.
pub fn load_targets(path: &Path) -> Result<Vec<Target>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("targets file not found at {}", path.display()))?;
    parse_targets(file).with_context(|| format!("failed to read targets from {}", path.display()))
}

/// Parse targets from CSV. Extra columns are ignored; blank rows are skipped.
pub fn parse_targets<R: Read>(reader: R) -> Result<Vec<Target>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

    let headers = reader.headers()?.clone();
    if !headers.iter().any(|h| h == "Make") || !headers.iter().any(|h| h == "Model") {
        bail!(
            "input must contain 'Make' and 'Model' columns, found {:?}",
            headers.iter().collect::<Vec<_>>()
        );
    }

    let mut targets = Vec::new();
    for (line, row) in reader.deserialize::<Target>().enumerate() {
        let target = row.with_context(|| format!("bad target row {}", line + 2))?;
        if target.make.is_empty() || target.model.is_empty() {
            tracing::warn!(row = line + 2, "Skipping target with empty make or model");
            continue;
        }
        targets.push(target);
    }
    Ok(targets)
}
