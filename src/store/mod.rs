//! JSON file stores.
//!
//! Two stores back the engine, mirroring the browser's storage areas:
//!
//! - [`SettingsStore`] (`settings.json`): rules, global toggle, theme.
//! - [`LocalStore`] (`local_state.json`): execution records and last status.
//!
//! Each store keeps its document in memory behind an async mutex and writes
//! the whole file on every mutation. A store opened without a path lives only
//! in memory.

pub mod local;
pub mod settings;

pub use local::{LocalState, LocalStore};
pub use settings::{RuleDraft, RulePatch, SettingsPatch, SettingsStore};

use crate::error::{PulseError, Result};
use std::path::Path;

/// Read a document's bytes. A missing or blank file is `Ok(None)`.
pub(crate) fn read_document(path: &Path) -> Result<Option<Vec<u8>>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PulseError::Storage(format!(
                "cannot read {}: {e}",
                path.display()
            )));
        }
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(bytes))
}

/// Read a JSON document. A missing or blank file is `Ok(None)`.
pub(crate) fn read_json(path: &Path) -> Result<Option<serde_json::Value>> {
    let Some(bytes) = read_document(path)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PulseError::Storage(format!("cannot parse {}: {e}", path.display())))
}

/// Write a JSON document atomically (temp file, then rename).
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| PulseError::Storage(format!("cannot create store dir: {e}")))?;
    }

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| PulseError::Storage(format!("cannot serialize store: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json).map_err(|e| {
        PulseError::Storage(format!("cannot write {}: {e}", tmp_path.display()))
    })?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| PulseError::Storage(format!("cannot replace {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn missing_and_blank_files_read_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.json");
        assert!(read_json(&path).expect("read").is_none());

        std::fs::write(&path, "  \n").expect("write");
        assert!(read_json(&path).expect("read").is_none());
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("doc.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).expect("write");

        assert_eq!(
            read_json(&path).expect("read"),
            Some(serde_json::json!({"a": 1}))
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(matches!(read_json(&path), Err(PulseError::Storage(_))));
    }
}
