// Файловое хранилище
//
// Раскладка: <root>/<namespace>/<hex(key)>. Запись атомарная:
// временный файл, fsync, rename поверх старого.

use crate::storage::BlobStore;
use crate::utils::error::StorageError;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const TMP_SUFFIX: &str = ".tmp";

pub struct FileBlobStore {
    root: PathBuf,
    // Сериализует запись временных файлов
    write_lock: Mutex<()>,
}

impl FileBlobStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(target: "storage", root = %root.display(), "Opened file store");

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StorageError> {
        let valid = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::Io(format!("Invalid namespace: {:?}", namespace)));
        }
        Ok(self.root.join(namespace))
    }

    fn record_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StorageError> {
        // hex, чтобы любой ключ был валидным именем файла
        Ok(self.namespace_dir(namespace)?.join(hex::encode(key.as_bytes())))
    }
}

fn restrict_permissions(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

impl BlobStore for FileBlobStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.record_path(namespace, key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let dir = self.namespace_dir(namespace)?;
        let path = self.record_path(namespace, key)?;
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(TMP_SUFFIX);
        let tmp_path = PathBuf::from(tmp_name);

        let _guard = self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)?;
        fs::create_dir_all(&dir)?;

        let mut file = fs::File::create(&tmp_path)?;
        restrict_permissions(&tmp_path)?;
        file.write_all(value)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.record_path(namespace, key)?;
        let _guard = self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.namespace_dir(namespace)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }

            match hex::decode(name).ok().and_then(|raw| String::from_utf8(raw).ok()) {
                Some(key) => keys.push(key),
                None => warn!(target: "storage", file = name, "Skipping foreign file in store"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();

        store.put("sessions", "alice/1", b"state").unwrap();
        assert_eq!(store.get("sessions", "alice/1").unwrap(), Some(b"state".to_vec()));
        assert_eq!(store.list("sessions").unwrap(), vec!["alice/1".to_string()]);

        store.put("sessions", "alice/1", b"newer").unwrap();
        assert_eq!(store.get("sessions", "alice/1").unwrap(), Some(b"newer".to_vec()));

        assert!(store.delete("sessions", "alice/1").unwrap());
        assert_eq!(store.get("sessions", "alice/1").unwrap(), None);
        assert!(!store.delete("sessions", "alice/1").unwrap());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileBlobStore::open(dir.path()).unwrap();
            store.put("identity", "local", &[9u8; 64]).unwrap();
        }

        let reopened = FileBlobStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("identity", "local").unwrap(), Some(vec![9u8; 64]));
    }

    #[test]
    fn test_file_store_ignores_leftover_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();
        store.put("trust", "bob", b"x").unwrap();
        std::fs::write(dir.path().join("trust").join("deadbeef.tmp"), b"partial").unwrap();

        assert_eq!(store.list("trust").unwrap(), vec!["bob".to_string()]);
    }

    #[test]
    fn test_file_store_rejects_path_like_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();
        assert!(store.put("../escape", "k", b"v").is_err());
    }
}
