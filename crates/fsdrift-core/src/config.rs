use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::op::OpKind;
use crate::probability::ProbabilityTable;

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("decoding JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    UnknownKind(#[from] crate::op::UnknownKind),

    #[error("incomplete probabilities: {have}/{want}")]
    Incomplete { have: usize, want: usize },

    #[error("probabilities sum to zero")]
    ZeroMass,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    probabilities: Option<BTreeMap<String, u32>>,
}

/// Load a probability table from JSON text.
///
/// A config without a `probabilities` key yields the uniform table. A
/// `probabilities` map must name every operation kind exactly; weights are
/// rescaled so they sum to 100.
pub fn load_config(text: &str) -> Result<ProbabilityTable, ConfigError> {
    let raw: RawConfig = serde_json::from_str(text)?;
    let Some(map) = raw.probabilities else {
        return Ok(ProbabilityTable::uniform());
    };

    let mut weights = [0u32; OpKind::COUNT];
    let mut have = 0;
    for (name, weight) in &map {
        let kind: OpKind = name.parse()?;
        weights[kind.index()] = *weight;
        have += 1;
    }
    if have != OpKind::COUNT {
        return Err(ConfigError::Incomplete { have, want: OpKind::COUNT });
    }
    if weights.iter().all(|w| *w == 0) {
        return Err(ConfigError::ZeroMass);
    }
    Ok(ProbabilityTable::from_weights(weights))
}

/// Load a probability table from a JSON file.
pub fn load_config_file(path: &Path) -> Result<ProbabilityTable, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    load_config(&text)
}
