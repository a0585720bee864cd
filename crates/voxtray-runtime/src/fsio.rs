use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::Serialize;

/// Whole-document replace: write to a sibling temp file, then rename over
/// the target. Readers never observe a partially written document.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("create dir failed: {}", dir.display()))?;
    let tmp = dir.join(format!(
        ".{}.{}.part",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string()),
        std::process::id()
    ));
    fs::write(&tmp, bytes).with_context(|| format!("write temp file failed: {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("rename into place failed: {}", path.display()));
    }
    Ok(())
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(value).context("serialize json failed")?;
    write_atomic(path, s.as_bytes())
}
