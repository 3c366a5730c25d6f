//! Seeding the in-memory agent config from a JSON file (`--agent-config`).

use std::path::Path;

use anyhow::{Context, Result};

use tether_core::{ConfigPatch, ConfigStore};

/// Build a [`ConfigStore`], applying `path` as a partial update if given.
///
/// The file is only read; later edits through the control surface are not
/// written back.
pub fn seed_store(path: Option<&Path>) -> Result<ConfigStore> {
    let store = ConfigStore::new();
    let Some(path) = path else {
        return Ok(store);
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read agent config at {}", path.display()))?;
    let patch = ConfigPatch::from_json(&text)
        .with_context(|| format!("invalid agent config in {}", path.display()))?;
    let fields = patch.provided_fields();
    store
        .update(patch)
        .with_context(|| format!("invalid agent config in {}", path.display()))?;

    tracing::info!(path = %path.display(), ?fields, "seeded agent config");
    Ok(store)
}
