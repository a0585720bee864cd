use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Root directory for everything the runtime persists: `config.json`,
/// `installer-state.json`, `secrets-fallback.json`, logs.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("VOXTRAY_DATA_DIR") {
        return Ok(PathBuf::from(p));
    }
    // Dev default: repo-root/tmp/voxtray-data
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let root = dir
        .ancestors()
        .nth(2)
        .ok_or_else(|| anyhow!("failed to locate repo root"))?;
    Ok(root.join("tmp").join("voxtray-data"))
}

pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = data_dir()?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir failed: {}", dir.display()))?;
    Ok(dir)
}

/// Scratch directory for transient audio/image files. Callers are expected
/// to delete what they create; this only guarantees the directory exists.
pub fn temp_dir(data_dir: &Path) -> Result<PathBuf> {
    let dir = data_dir.join("tmp");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create temp dir failed: {}", dir.display()))?;
    Ok(dir)
}
