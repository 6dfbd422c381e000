//! Atomic JSON document persistence shared by the stores.
//!
//! Every durable document in this engine (state categories, checkpoints,
//! the latest pointer, the learnings store) is written the same way:
//! serialize to pretty JSON, write a hidden temp sibling, rename into
//! place. A reader never observes a half-written document. On platforms
//! where rename cannot replace an existing destination, fall back to
//! copy + best-effort temp cleanup.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Write `value` to `path` as pretty JSON, all-or-nothing.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("{} has no usable file name", path.display()))?;
    let tmp = parent.join(format!(".{file_name}.tmp"));

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("failed to serialize {file_name}: {e}"))?;
    fs::write(&tmp, &json).map_err(|e| format!("failed to write {}: {e}", tmp.display()))?;

    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // Windows refuses to rename over an existing file. Copy, restrict
            // permissions to the owner, then clean up the temp best-effort.
            fs::copy(&tmp, path).map_err(|e| {
                format!(
                    "rename failed ({rename_err}) and copy fallback failed for {}: {e}",
                    path.display()
                )
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
            }
            let _ = fs::remove_file(&tmp);
            Ok(())
        }
    }
}

/// Read a JSON document. `Ok(None)` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, String> {
    let json = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("failed to read {}: {e}", path.display())),
    };
    let value: T = serde_json::from_str(&json)
        .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc {
            name: "x".into(),
            count: 3,
        };
        write_json_atomic(&path, &doc).unwrap();
        let loaded: Doc = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn write_replaces_existing_without_temp_residue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &Doc { name: "a".into(), count: 1 }).unwrap();
        write_json_atomic(&path, &Doc { name: "b".into(), count: 2 }).unwrap();

        let loaded: Doc = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded.name, "b");
        assert!(!dir.path().join(".doc.json.tmp").exists());
    }

    #[test]
    fn write_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/doc.json");
        write_json_atomic(&path, &Doc { name: "n".into(), count: 0 }).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result: Option<Doc> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn read_malformed_is_error_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        let result: Result<Option<Doc>, String> = read_json(&path);
        assert!(result.is_err());
    }
}
