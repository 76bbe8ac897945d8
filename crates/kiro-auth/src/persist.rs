//! Atomic JSON persistence shared by every on-disk file
//!
//! Credential files, the installed current token, the usage cache and the
//! usage-stats file are all small JSON documents. Each write goes to a temp
//! file in the target directory and is renamed over the destination, so a
//! crash mid-write never leaves a truncated file behind.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// Serialize `data` as pretty JSON and write it atomically to `path`.
///
/// Creates the parent directory if needed. File permissions are set to 0600
/// (owner read/write only) since most of these files contain tokens.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing {}: {e}", path.display())))?;
    write_bytes_atomic(path, json.as_bytes()).await
}

/// Write raw bytes atomically to `path` (temp file + rename, 0600).
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io(format!("{} has no parent directory", path.display())))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_path = dir.join(format!(".{file_name}.{}.{seq}.tmp", std::process::id()));

    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp file for {}: {e}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting permissions on {}: {e}", path.display())))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp file onto {}: {e}", path.display())))?;

    debug!(path = %path.display(), "persisted");
    Ok(())
}

/// Read and parse a JSON file, returning `None` if it does not exist.
pub async fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(format!("reading {}: {e}", path.display()))),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| Error::CredentialParse(format!("parsing {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stats.json");

        let mut data = HashMap::new();
        data.insert("token-a.json".to_string(), 3u32);
        write_json_atomic(&path, &data).await.unwrap();

        let back: HashMap<String, u32> = read_json_optional(&path).await.unwrap().unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let back: Option<HashMap<String, u32>> =
            read_json_optional(&dir.path().join("absent.json")).await.unwrap();
        assert!(back.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let result: Result<Option<HashMap<String, u32>>> = read_json_optional(&path).await;
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        for i in 0..5u32 {
            write_json_atomic(&path, &i).await.unwrap();
        }

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["cache.json"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token-a.json");
        write_json_atomic(&path, &"x").await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }
}
