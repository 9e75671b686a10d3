use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_MODE: u32 = 0o644;

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

/// Writes `contents` to a temp file next to `path`, syncs it and renames it
/// into place. An existing file's mode is kept.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mode = match fs::metadata(path) {
        Ok(metadata) => metadata.permissions().mode() & 0o7777,
        Err(err) if err.kind() == io::ErrorKind::NotFound => DEFAULT_CONFIG_MODE,
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };
    write_atomic_with_mode(path, contents, mode)
}

pub fn write_atomic_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path has no parent directory: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let tmp_path = temp_sibling(path)?;
    let write_result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(contents)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set mode on {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                tmp_path.display(),
                path.display()
            )
        })
    })();

    if write_result.is_err() {
        let _ = remove_file_if_exists(&tmp_path);
    }
    write_result
}

/// Copies `src` over `dst` through a temp file, keeping `src`'s mode.
pub fn copy_atomic(src: &Path, dst: &Path) -> Result<()> {
    let contents = fs::read(src).with_context(|| format!("failed to read {}", src.display()))?;
    let mode = fs::metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?
        .permissions()
        .mode()
        & 0o7777;
    write_atomic_with_mode(dst, &contents, mode)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&contents)))
}

fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?;
    Ok(path.with_file_name(format!(
        ".{file_name}.lintune-tmp-{}",
        std::process::id()
    )))
}

pub fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
