//! Atomic keystore persistence.
//!
//! Saves go through write-temp + fsync + rename so a crash at any point
//! leaves either the old file or the new file, never a torn one. Loading
//! runs the migration chain; when a migration fires, the pre-migration
//! bytes are preserved as `<stem>.vN.backup` before the upgraded file is
//! persisted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use onestar_core::error::{Result, VaultError};

use crate::codec;
use crate::migrate;
use crate::model::Keystore;

pub struct KeystoreStore {
    path: PathBuf,
}

impl KeystoreStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn backup_path(&self, version: &str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();
        self.path.with_file_name(format!("{stem}.{version}.backup"))
    }

    /// Serialize and persist atomically. The previous file survives
    /// byte-for-byte if any step fails.
    pub fn atomic_save(&self, keystore: &Keystore) -> Result<()> {
        keystore.validate()?;
        let bytes = codec::canonical_json(keystore)?;
        self.atomic_write(&bytes)
    }

    fn atomic_write(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "keystore saved");
        Ok(())
    }

    /// Load the keystore, migrating older formats in place. Migrations are
    /// idempotent; a second load of a migrated file takes the fast path.
    pub fn load(&self) -> Result<Keystore> {
        let raw = fs::read(&self.path)?;
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| VaultError::CorruptKeystore(format!("not valid JSON: {e}")))?;

        let migrated = migrate::migrate_to_latest(value)?;

        if let Some(from) = &migrated.from_version {
            let backup = self.backup_path(from);
            fs::write(&backup, &raw)?;
            tracing::info!(backup = %backup.display(), "pre-migration snapshot written");
        }

        let keystore: Keystore = serde_json::from_value(migrated.value)
            .map_err(|e| VaultError::CorruptKeystore(e.to_string()))?;
        keystore.validate()?;

        if migrated.from_version.is_some() {
            self.atomic_save(&keystore)?;
        }

        Ok(keystore)
    }

    /// Explicit destruction: the keystore file, its temp file and every
    /// version backup are removed.
    pub fn erase(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        let tmp = self.tmp_path();
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        for version in ["v1", "v2", "v3"] {
            let backup = self.backup_path(version);
            if backup.exists() {
                fs::remove_file(&backup)?;
            }
        }
        tracing::info!(path = %self.path.display(), "keystore erased");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MIN_PBKDF2_ITERATIONS;
    use tempfile::TempDir;

    const PASSWORD: &str = "correct-horse-battery-staple-99";

    fn fresh(dir: &Path) -> (KeystoreStore, Keystore) {
        let store = KeystoreStore::new(dir.join("keystore.json"));
        let (keystore, _) =
            codec::create_keystore(PASSWORD, None, "test-device", MIN_PBKDF2_ITERATIONS).unwrap();
        (store, keystore)
    }

    #[test]
    fn save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let (store, keystore) = fresh(tmp.path());

        store.atomic_save(&keystore).unwrap();
        assert!(store.exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.user_id, keystore.user_id);
        assert_eq!(loaded.current_keypair.key_id, keystore.current_keypair.key_id);
        assert_eq!(loaded.password_salt, keystore.password_salt);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let (store, keystore) = fresh(tmp.path());
        store.atomic_save(&keystore).unwrap();

        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["keystore.json".to_string()]);
    }

    #[test]
    fn overwrite_replaces_contents() {
        let tmp = TempDir::new().unwrap();
        let (store, mut keystore) = fresh(tmp.path());
        store.atomic_save(&keystore).unwrap();

        keystore.device_name = "renamed-device".into();
        store.atomic_save(&keystore).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.device_name, "renamed-device");
    }

    #[test]
    fn load_missing_file_is_io_failure() {
        let tmp = TempDir::new().unwrap();
        let store = KeystoreStore::new(tmp.path().join("absent.json"));
        assert!(matches!(store.load(), Err(VaultError::IoFailure(_))));
    }

    #[test]
    fn load_garbage_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keystore.json");
        fs::write(&path, b"definitely not json").unwrap();
        let store = KeystoreStore::new(path);
        assert!(matches!(store.load(), Err(VaultError::CorruptKeystore(_))));
    }

    #[test]
    fn erase_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let (store, keystore) = fresh(tmp.path());
        store.atomic_save(&keystore).unwrap();
        fs::write(store.backup_path("v3"), b"old bytes").unwrap();

        store.erase().unwrap();
        assert!(!store.exists());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
