use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating {}", parent.display()))?;
    }
    Ok(())
}

/// Sibling `<name>.tmp` path used for write-then-rename output replacement.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("output");
    path.with_file_name(format!("{file_name}.tmp"))
}

pub fn commit_tmp_file(tmp_path: &Path, output_path: &Path) -> Result<()> {
    fs::rename(tmp_path, output_path).with_context(|| {
        format!(
            "Failed moving {} to {}",
            tmp_path.display(),
            output_path.display()
        )
    })
}
