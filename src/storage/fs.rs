use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Mode for files that may carry the controller token
pub const PRIVATE_MODE: u32 = 0o600;

/// Mode for everything else the engine writes
const SHARED_MODE: u32 = 0o644;

/// Replace `path` with `content` so readers see either the old or the new
/// file, never a partial one.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    replace_file(path, content, SHARED_MODE)
}

/// Like [`atomic_write`], but the file is readable by its owner only from
/// the moment it is created.
pub fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    replace_file(path, content, PRIVATE_MODE)
}

/// Ensure a directory exists, creating it and all parents if needed
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if !path.is_dir() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }

    Ok(())
}

fn replace_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_directory_exists(parent)?;

    let temp_path = temp_path_for(path);
    let written = write_synced(&temp_path, content, mode).and_then(|()| {
        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            )
        })
    });

    if written.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    written?;

    sync_directory(parent)
}

/// Hidden, unique sibling of `path`; concurrent writers never share one
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

fn write_synced(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create temporary file: {}", path.display()))?;

    file.write_all(content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {} to disk", path.display()))
}

/// Persist the rename itself (Unix; directories cannot be synced elsewhere)
fn sync_directory(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("Failed to sync directory: {}", dir.display()))?;
    }
    #[cfg(not(unix))]
    let _ = dir;

    Ok(())
}
