//! Atomic file-write helpers shared by the stores.
//!
//! Writers produce a uniquely-named temp sibling, flush and sync it,
//! then rename over the target. The rename is the linearization point.
//! When `keep_bak` is set the previous version survives as `.bak`, so
//! recovery is bounded to "load either the current or previous file".

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

fn temp_sibling(path: &Path) -> PathBuf {
    let token = uuid::Uuid::new_v4().simple().to_string();
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", &token[..6]));
    path.with_file_name(name)
}

/// Path of the backup sibling for `path`.
pub fn bak_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

/// Atomically replace `path` with `bytes`.
pub async fn write_atomic(path: &Path, bytes: &[u8], keep_bak: bool) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp = temp_sibling(path);
    let mut file = fs::File::create(&temp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if keep_bak && fs::try_exists(path).await.unwrap_or(false) {
        fs::rename(path, bak_path(path)).await?;
    }
    fs::rename(&temp, path).await?;
    Ok(())
}

/// Read `path`, falling back to its `.bak` sibling when the primary is
/// missing or fails `parse`. Returns `None` when neither exists.
pub async fn read_with_backup<T>(
    path: &Path,
    parse: impl Fn(&str) -> Result<T, StoreError>,
) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(raw) => match parse(&raw) {
            Ok(value) => return Ok(Some(value)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "store file corrupt, trying backup");
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let bak = bak_path(path);
    match fs::read_to_string(&bak).await {
        Ok(raw) => parse(&raw).map(Some).map_err(|_| StoreError::Corrupt {
            path: path.to_path_buf(),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
