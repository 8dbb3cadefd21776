//! Cleanup audit history inside the run manifest.
//!
//! The manifest is an arbitrary JSON object owned by the pipeline; only
//! `housekeeping.cleanup_history` is touched here. Every other member is
//! preserved as-is.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::CleanupError;

/// Number of entries kept in `cleanup_history`.
pub const HISTORY_LIMIT: usize = 10;

/// One cleanup invocation, newest first in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupEntry {
    pub at_utc: String,
    pub applied: bool,
    pub bytes_freed_est: u64,
    pub targets_count: usize,
    #[serde(default)]
    pub deleted_count: usize,
    pub keep_main_image: bool,
    pub delete_final_video: bool,
    pub force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_video_retained_reason: Option<String>,
}

fn lock_path(manifest: &Path) -> PathBuf {
    let name = manifest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manifest".to_string());
    manifest.with_file_name(format!(".{name}.lock"))
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> CleanupError + 'a {
    move |source| CleanupError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

fn malformed(path: &Path, reason: &str) -> CleanupError {
    CleanupError::MalformedManifest {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn read_manifest(path: &Path) -> Result<Map<String, Value>, CleanupError> {
    let bytes = fs::read(path).map_err(io_err("read manifest", path))?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|source| CleanupError::Json {
        what: "manifest",
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Object(obj) => Ok(obj),
        _ => Err(malformed(path, "top level is not an object")),
    }
}

/// `housekeeping.cleanup_history`, created if absent or null.
fn history_mut<'m>(
    manifest: &'m mut Map<String, Value>,
    path: &Path,
) -> Result<&'m mut Vec<Value>, CleanupError> {
    let housekeeping = manifest
        .entry("housekeeping")
        .or_insert_with(|| Value::Object(Map::new()));
    if housekeeping.is_null() {
        *housekeeping = Value::Object(Map::new());
    }
    let Value::Object(housekeeping) = housekeeping else {
        return Err(malformed(path, "housekeeping is not an object"));
    };

    let history = housekeeping
        .entry("cleanup_history")
        .or_insert_with(|| Value::Array(Vec::new()));
    if history.is_null() {
        *history = Value::Array(Vec::new());
    }
    match history {
        Value::Array(history) => Ok(history),
        _ => Err(malformed(path, "housekeeping.cleanup_history is not an array")),
    }
}

/// Write-temp-then-rename in the manifest's own directory. The replacement
/// keeps the permissions of the file it replaces.
fn write_atomic(path: &Path, manifest: &Map<String, Value>) -> Result<(), CleanupError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err("create temp manifest", dir))?;
    serde_json::to_writer_pretty(&mut tmp, manifest).map_err(|source| CleanupError::Json {
        what: "manifest",
        path: path.to_path_buf(),
        source,
    })?;
    tmp.write_all(b"\n").map_err(io_err("write temp manifest", path))?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .map_err(io_err("copy manifest permissions", path))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(io_err("sync temp manifest", path))?;
    tmp.persist(path).map_err(|e| CleanupError::Io {
        op: "replace manifest",
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Holds an exclusive advisory lock on the manifest's sidecar lock file.
/// The lock file itself is left in place.
struct ManifestLock {
    file: File,
}

impl ManifestLock {
    fn acquire(manifest: &Path) -> Result<Self, CleanupError> {
        let path = lock_path(manifest);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err("open manifest lock", &path))?;
        file.lock_exclusive()
            .map_err(io_err("lock manifest", &path))?;
        Ok(Self { file })
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// A locked, parsed and shape-checked manifest, ready to take one entry.
///
/// Opening fails on an unreadable or malformed manifest, so callers open it
/// before doing anything irreversible. The lock is held until `commit` or
/// drop.
pub struct ManifestSession {
    path: PathBuf,
    manifest: Map<String, Value>,
    _lock: ManifestLock,
}

impl ManifestSession {
    pub fn open(path: &Path) -> Result<Self, CleanupError> {
        let lock = ManifestLock::acquire(path)?;
        let mut manifest = read_manifest(path)?;
        history_mut(&mut manifest, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
            _lock: lock,
        })
    }

    /// Prepend `entry`, trim to `HISTORY_LIMIT`, and replace the manifest
    /// atomically. Returns the resulting history length.
    pub fn commit(mut self, entry: &CleanupEntry) -> Result<usize, CleanupError> {
        let entry = serde_json::to_value(entry).map_err(|source| CleanupError::Json {
            what: "cleanup entry",
            path: self.path.clone(),
            source,
        })?;
        let history = history_mut(&mut self.manifest, &self.path)?;
        history.insert(0, entry);
        history.truncate(HISTORY_LIMIT);
        let len = history.len();

        write_atomic(&self.path, &self.manifest)?;
        Ok(len)
    }
}

/// Open, append one entry, commit.
///
/// On any error the manifest on disk is left untouched.
pub fn record_cleanup(path: &Path, entry: &CleanupEntry) -> Result<usize, CleanupError> {
    ManifestSession::open(path)?.commit(entry)
}

/// Entries as stored, newest first. Entries that do not parse are skipped.
pub fn read_history(path: &Path) -> Result<Vec<CleanupEntry>, CleanupError> {
    let manifest = read_manifest(path)?;
    let entries = manifest
        .get("housekeeping")
        .and_then(|h| h.get("cleanup_history"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(n: u64) -> CleanupEntry {
        CleanupEntry {
            at_utc: format!("2024-01-01T00:00:{n:02}Z"),
            applied: false,
            bytes_freed_est: n,
            targets_count: 0,
            deleted_count: 0,
            keep_main_image: false,
            delete_final_video: false,
            force: false,
            final_video_retained_reason: None,
        }
    }

    fn manifest(dir: &Path, value: Value) -> PathBuf {
        let path = dir.join("manifest.json");
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        path
    }

    #[test]
    fn history_is_newest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest(dir.path(), json!({ "run_id": "r1" }));

        for n in 0..13 {
            let len = record_cleanup(&path, &entry(n)).unwrap();
            assert_eq!(len, (n as usize + 1).min(HISTORY_LIMIT));
        }

        let history = read_history(&path).unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].bytes_freed_est, 12);
        assert_eq!(history[9].bytes_freed_est, 3);
    }

    #[test]
    fn other_manifest_members_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest(
            dir.path(),
            json!({ "run_id": "r1", "housekeeping": { "owner": "ops" }, "steps": [1, 2] }),
        );
        record_cleanup(&path, &entry(1)).unwrap();

        let value: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["run_id"], "r1");
        assert_eq!(value["steps"], json!([1, 2]));
        assert_eq!(value["housekeeping"]["owner"], "ops");
        assert_eq!(value["housekeeping"]["cleanup_history"][0]["bytes_freed_est"], 1);
        assert!(value["housekeeping"]["cleanup_history"][0]
            .get("final_video_retained_reason")
            .is_none());
    }

    #[test]
    fn unreadable_manifest_is_fatal_and_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, b"{ not json").unwrap();

        let err = record_cleanup(&path, &entry(1)).unwrap_err();
        assert!(matches!(err, CleanupError::Json { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"{ not json");
    }

    #[test]
    fn malformed_history_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest(dir.path(), json!({ "housekeeping": { "cleanup_history": "oops" } }));
        let before = fs::read(&path).unwrap();

        let err = record_cleanup(&path, &entry(1)).unwrap_err();
        assert!(matches!(err, CleanupError::MalformedManifest { .. }));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn no_temp_files_are_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest(dir.path(), json!({}));
        record_cleanup(&path, &entry(1)).unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![".manifest.json.lock", "manifest.json"]);
    }

    #[test]
    fn malformed_housekeeping_fails_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest(dir.path(), json!({ "housekeeping": [1, 2] }));

        assert!(matches!(
            ManifestSession::open(&path),
            Err(CleanupError::MalformedManifest { .. })
        ));
        assert!(ManifestSession::open(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn concurrent_recorders_lose_no_entries() {
        for writers in [6_u64, 14] {
            let dir = tempfile::tempdir().unwrap();
            let path = manifest(dir.path(), json!({ "run_id": "r1" }));

            std::thread::scope(|scope| {
                for n in 0..writers {
                    let path = &path;
                    scope.spawn(move || record_cleanup(path, &entry(n)).unwrap());
                }
            });

            let history = read_history(&path).unwrap();
            assert_eq!(history.len(), (writers as usize).min(HISTORY_LIMIT));
            let mut seen: Vec<u64> = history.iter().map(|e| e.bytes_freed_est).collect();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), history.len());
        }
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_keeps_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = manifest(dir.path(), json!({}));
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        record_cleanup(&path, &entry(1)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }
}
