use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Durable key/value storage for session fields.
///
/// Each field is stored under its own key. A missing key means the field is
/// absent; removing a key that is not there is not an error.
pub trait CredentialStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn store(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Stores fields as a flat JSON object in `session.json`.
pub struct FileStorage {
    cache_dir: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            lock: Mutex::new(()),
        }
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        serde_json::from_str(&contents).context("Failed to parse session file")
    }

    fn write_all(&self, fields: &BTreeMap<String, String>) -> Result<()> {
        let path = self.session_path();
        if fields.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path).context("Failed to remove session file")?;
            }
            return Ok(());
        }

        std::fs::create_dir_all(&self.cache_dir)?;
        let contents = serde_json::to_string_pretty(fields)?;
        write_private(&path, contents.as_bytes()).context("Failed to write session file")
    }

    fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut fields = self.read_all()?;
        f(&mut fields);
        self.write_all(&fields)
    }
}

/// Write `contents` to `path`, readable by the owner only.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::fs::{OpenOptions, Permissions};
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on create; tighten a file left by an older version.
    file.set_permissions(Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

impl CredentialStorage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_all()?.remove(key))
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.modify(|fields| {
            fields.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.modify(|fields| {
            fields.remove(key);
        })
    }
}

/// In-process storage. Clones share the same map, so a second `SessionStore`
/// opened over a clone sees what the first one wrote.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    fields: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.lock().map(|f| f.is_empty()).unwrap_or(true)
    }
}

impl CredentialStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let fields = self
            .fields
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        Ok(fields.get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        let mut fields = self
            .fields
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        fields.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut fields = self
            .fields
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        fields.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_session_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SESSION_FILE);
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let storage = FileStorage::new(dir.path().to_path_buf());
        storage.store("accessToken", "a1").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let fresh = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(fresh.path().join("nested"));
        storage.store("refreshToken", "r1").unwrap();
        let mode = std::fs::metadata(fresh.path().join("nested").join(SESSION_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(storage.load("refreshToken").unwrap().as_deref(), Some("r1"));
    }

    #[test]
    fn test_file_storage_fields_are_independent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(dir.path().join("nested"));

        assert_eq!(storage.load("accessToken").unwrap(), None);

        storage.store("accessToken", "a1").unwrap();
        storage.store("refreshToken", "r1").unwrap();
        storage.store("accessToken", "a2").unwrap();

        assert_eq!(storage.load("accessToken").unwrap().as_deref(), Some("a2"));
        assert_eq!(storage.load("refreshToken").unwrap().as_deref(), Some("r1"));

        storage.remove("accessToken").unwrap();
        assert_eq!(storage.load("accessToken").unwrap(), None);
        assert_eq!(storage.load("refreshToken").unwrap().as_deref(), Some("r1"));
    }

    #[test]
    fn test_file_storage_removes_file_when_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(dir.path().to_path_buf());

        storage.store("user", "{}").unwrap();
        assert!(dir.path().join(SESSION_FILE).exists());

        storage.remove("user").unwrap();
        assert!(!dir.path().join(SESSION_FILE).exists());

        // removing again is fine
        storage.remove("user").unwrap();
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        FileStorage::new(dir.path().to_path_buf())
            .store("refreshToken", "r1")
            .unwrap();

        let reopened = FileStorage::new(dir.path().to_path_buf());
        assert_eq!(reopened.load("refreshToken").unwrap().as_deref(), Some("r1"));
    }

    #[test]
    fn test_file_storage_rejects_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(SESSION_FILE), "not json").unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        assert!(storage.load("accessToken").is_err());
    }

    #[test]
    fn test_memory_storage_clones_share_state() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        storage.store("accessToken", "a").unwrap();
        assert_eq!(other.load("accessToken").unwrap().as_deref(), Some("a"));
        other.remove("accessToken").unwrap();
        assert!(storage.is_empty());
    }
}
