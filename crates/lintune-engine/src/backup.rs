use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use lintune_core::EngineError;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::fs_utils::{copy_atomic, read_optional, remove_file_if_exists, sha256_file, write_atomic};
use crate::HostLayout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub created_at_unix_nanos: u64,
    /// Empty when `existed` is false.
    pub sha256: String,
    /// False records that the path did not exist before the first mutation;
    /// restoring such a record removes the file.
    pub existed: bool,
}

const ABSENT_DIGEST: &str = "-";

/// Pre-mutation copies of protected files. The first copy of a path wins;
/// later calls return the existing record until it is discarded.
pub struct BackupVault<'a> {
    layout: &'a HostLayout,
}

impl<'a> BackupVault<'a> {
    pub fn new(layout: &'a HostLayout) -> Self {
        Self { layout }
    }

    /// Records the state of `path` before its first mutation. A missing file
    /// yields an absence record so a later restore removes it again.
    pub fn ensure_backed(&self, path: &Path) -> Result<BackupRecord, EngineError> {
        let backup_failed = |detail: String| EngineError::BackupFailed {
            path: path.to_path_buf(),
            detail,
        };

        let mut records = self.load().map_err(|err| backup_failed(format!("{err:#}")))?;
        if let Some(existing) = records.iter().find(|record| record.original_path == path) {
            if !existing.existed || existing.backup_path.exists() {
                debug!(path = %path.display(), "backup already present");
                return Ok(existing.clone());
            }
            warn!(
                path = %path.display(),
                backup = %existing.backup_path.display(),
                "dropping index entry for missing backup file"
            );
            records.retain(|record| record.original_path != path);
        }

        let backup_path = self.layout.backup_path_for(path);
        match fs::symlink_metadata(path) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let record = BackupRecord {
                    original_path: path.to_path_buf(),
                    backup_path,
                    created_at_unix_nanos: current_unix_nanos(),
                    sha256: String::new(),
                    existed: false,
                };
                records.push(record.clone());
                self.store(&records)
                    .map_err(|err| backup_failed(format!("{err:#}")))?;
                debug!(path = %path.display(), "recorded absence of protected file");
                return Ok(record);
            }
            Err(err) => return Err(backup_failed(err.to_string())),
        }

        // A backup file without an index entry predates this index; adopt it
        // rather than overwrite the older copy.
        if !backup_path.exists() {
            copy_atomic(path, &backup_path).map_err(|err| backup_failed(format!("{err:#}")))?;
        }
        let sha256 = sha256_file(&backup_path).map_err(|err| backup_failed(format!("{err:#}")))?;
        let record = BackupRecord {
            original_path: path.to_path_buf(),
            backup_path,
            created_at_unix_nanos: current_unix_nanos(),
            sha256,
            existed: true,
        };
        records.push(record.clone());
        self.store(&records)
            .map_err(|err| backup_failed(format!("{err:#}")))?;
        info!(
            path = %path.display(),
            backup = %record.backup_path.display(),
            "backed up protected file"
        );
        Ok(record)
    }

    /// Puts `path` back the way it was before the first mutation: copies the
    /// verified backup over it, or removes it when it did not exist.
    pub fn restore(&self, path: &Path) -> Result<(), EngineError> {
        let backup_failed = |detail: String| EngineError::BackupFailed {
            path: path.to_path_buf(),
            detail,
        };

        let records = self.load().map_err(|err| backup_failed(format!("{err:#}")))?;
        let record = records
            .iter()
            .find(|record| record.original_path == path)
            .ok_or_else(|| EngineError::NoBackupFound {
                path: path.to_path_buf(),
            })?;
        if !record.existed {
            remove_file_if_exists(path).map_err(|err| backup_failed(err.to_string()))?;
            info!(path = %path.display(), "removed file that did not exist before install");
            return Ok(());
        }
        if !record.backup_path.exists() {
            return Err(EngineError::NoBackupFound {
                path: path.to_path_buf(),
            });
        }

        let actual = sha256_file(&record.backup_path)
            .map_err(|err| backup_failed(format!("{err:#}")))?;
        if actual != record.sha256 {
            return Err(backup_failed(format!(
                "backup {} digest mismatch: expected {}, found {actual}",
                record.backup_path.display(),
                record.sha256
            )));
        }

        copy_atomic(&record.backup_path, path).map_err(|err| backup_failed(format!("{err:#}")))?;
        info!(path = %path.display(), "restored protected file from backup");
        Ok(())
    }

    /// Removes the backup file and its index entry; a no-op when none exist.
    pub fn discard(&self, path: &Path) -> Result<(), EngineError> {
        let backup_failed = |detail: String| EngineError::BackupFailed {
            path: path.to_path_buf(),
            detail,
        };

        let mut records = self.load().map_err(|err| backup_failed(format!("{err:#}")))?;
        let backup_path = records
            .iter()
            .find(|record| record.original_path == path)
            .map(|record| record.backup_path.clone())
            .unwrap_or_else(|| self.layout.backup_path_for(path));
        remove_file_if_exists(&backup_path).map_err(|err| backup_failed(err.to_string()))?;

        let before = records.len();
        records.retain(|record| record.original_path != path);
        if records.len() != before {
            self.store(&records)
                .map_err(|err| backup_failed(format!("{err:#}")))?;
            debug!(path = %path.display(), "discarded backup");
        }
        Ok(())
    }

    pub fn records(&self) -> Result<Vec<BackupRecord>, EngineError> {
        self.load().map_err(|err| EngineError::BackupFailed {
            path: self.layout.backup_index_path(),
            detail: format!("{err:#}"),
        })
    }

    pub fn has_backup(&self, path: &Path) -> bool {
        self.layout.backup_path_for(path).exists()
    }

    fn load(&self) -> Result<Vec<BackupRecord>> {
        let path = self.layout.backup_index_path();
        let Some(raw) = read_optional(&path)
            .with_context(|| format!("failed to read backup index: {}", path.display()))?
        else {
            return Ok(Vec::new());
        };
        parse_backup_index(&raw)
            .with_context(|| format!("failed to parse backup index: {}", path.display()))
    }

    fn store(&self, records: &[BackupRecord]) -> Result<()> {
        let path = self.layout.backup_index_path();
        if records.is_empty() {
            return remove_file_if_exists(&path)
                .with_context(|| format!("failed to remove backup index: {}", path.display()));
        }
        write_atomic(&path, serialize_backup_index(records).as_bytes())
    }
}

fn current_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub(crate) fn serialize_backup_index(records: &[BackupRecord]) -> String {
    let mut payload = String::new();
    for record in records {
        payload.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            record.original_path.display(),
            record.backup_path.display(),
            record.created_at_unix_nanos,
            if record.existed {
                record.sha256.as_str()
            } else {
                ABSENT_DIGEST
            }
        ));
    }
    payload
}

pub(crate) fn parse_backup_index(raw: &str) -> Result<Vec<BackupRecord>> {
    let mut records = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields = line.split('\t').collect::<Vec<_>>();
        let [original, backup, created, sha256] = fields.as_slice() else {
            return Err(anyhow!(
                "line {} has {} fields, expected 4",
                index + 1,
                fields.len()
            ));
        };
        let created_at_unix_nanos = created
            .parse::<u64>()
            .with_context(|| format!("line {} has invalid timestamp '{created}'", index + 1))?;
        let existed = *sha256 != ABSENT_DIGEST;
        records.push(BackupRecord {
            original_path: PathBuf::from(original),
            backup_path: PathBuf::from(backup),
            created_at_unix_nanos,
            sha256: if existed {
                sha256.to_string()
            } else {
                String::new()
            },
            existed,
        });
    }
    Ok(records)
}
