//! On-disk layout of a PKI instance.
//!
//! ```text
//! <root>/config.toml
//! <root>/pki/ca.crt  ca.key  dh.pem  crl.pem  <name>.crt  <name>.key
//! <root>/pki/revoked/<serial>.crt  <serial>.key
//! <root>/clients/<name><suffix>.visz
//! <root>/server/server<suffix>.conf
//! ```
//!
//! Every file is written through a temporary file in the destination
//! directory and renamed into place, so a reader never sees a partial file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::configs::PkiConfig;
use crate::error::{PkiError, Result};

pub const CONFIG_FILE: &str = "config.toml";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
pub const DH_FILE: &str = "dh.pem";
pub const CRL_FILE: &str = "crl.pem";
pub const BUNDLE_EXTENSION: &str = "visz";

/// Paths of one PKI instance
#[derive(Debug, Clone)]
pub struct PkiLayout {
    root: PathBuf,
}

impl PkiLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn pki_dir(&self) -> PathBuf {
        self.root.join("pki")
    }

    pub fn clients_dir(&self) -> PathBuf {
        self.root.join("clients")
    }

    pub fn server_dir(&self) -> PathBuf {
        self.root.join("server")
    }

    /// File under `pki/`
    pub fn pki_file(&self, name: &str) -> PathBuf {
        self.pki_dir().join(name)
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.pki_file(CA_CERT_FILE)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.pki_file(CA_KEY_FILE)
    }

    pub fn dh_path(&self) -> PathBuf {
        self.pki_file(DH_FILE)
    }

    pub fn crl_path(&self) -> PathBuf {
        self.pki_file(CRL_FILE)
    }

    pub fn bundle_path(&self, name: &str, suffix: &str) -> PathBuf {
        self.clients_dir()
            .join(format!("{}{}.{}", name, suffix, BUNDLE_EXTENSION))
    }

    pub fn server_profile_path(&self, suffix: &str) -> PathBuf {
        self.server_dir().join(format!("server{}.conf", suffix))
    }

    pub fn is_initialized(&self) -> bool {
        self.config_path().is_file()
    }

    /// Make sure the root is a writable directory, creating it if absent
    pub fn prepare_root(&self) -> Result<()> {
        match fs::metadata(&self.root) {
            Ok(meta) if !meta.is_dir() => Err(PkiError::Path {
                path: self.root.clone(),
                reason: "exists but is not a directory".to_string(),
            }),
            Ok(meta) if meta.permissions().readonly() => Err(PkiError::Path {
                path: self.root.clone(),
                reason: "directory is not writable".to_string(),
            }),
            Ok(_) => Ok(()),
            Err(_) => fs::create_dir_all(&self.root).map_err(|e| PkiError::Path {
                path: self.root.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Create `pki/` and `clients/`; a failure here means the root is unusable
    pub fn create_directories(&self) -> Result<()> {
        for dir in [self.pki_dir(), self.clients_dir()] {
            fs::create_dir_all(&dir).map_err(|e| PkiError::Path {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn load_config(&self) -> Result<PkiConfig> {
        let path = self.config_path();
        if !path.is_file() {
            return Err(PkiError::NotInitialized(self.root.clone()));
        }
        let document = fs::read_to_string(&path).map_err(|e| PkiError::io(&path, e))?;
        PkiConfig::from_toml(&document)
    }

    pub fn save_config(&self, config: &PkiConfig) -> Result<()> {
        let document = config.to_toml()?;
        write_atomic(&self.config_path(), document.as_bytes())
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| PkiError::io(path, e))
    }
}

/// Write `contents` to `path` via a temporary file and an atomic rename.
///
/// The temporary file is created with owner-only permissions, which the
/// final file keeps.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| PkiError::io(dir, e))?;
    temp.write_all(contents)
        .map_err(|e| PkiError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| PkiError::io(temp.path(), e))?;
    temp.persist(path).map_err(|e| PkiError::io(path, e.error))?;
    debug!(path = %path.display(), bytes = contents.len(), "wrote file");
    Ok(())
}

/// Remove a file, ignoring one that is already gone
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PkiError::io(path, e)),
    }
}

/// File changes staged ahead of a configuration save.
///
/// Each touched path remembers what it held before the first change, so a
/// failed save can put the directory back the way it was. Saving the
/// configuration is the commit point; the transaction is simply dropped then.
#[derive(Debug, Default)]
pub struct FileTransaction {
    touched: Vec<(PathBuf, Option<Vec<u8>>)>,
}

impl FileTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current contents of `path` before something changes it
    pub fn track(&mut self, path: &Path) -> Result<()> {
        if self.touched.iter().any(|(p, _)| p == path) {
            return Ok(());
        }
        let previous = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(PkiError::io(path, e)),
        };
        self.touched.push((path.to_path_buf(), previous));
        Ok(())
    }

    pub fn write(&mut self, path: &Path, contents: &[u8]) -> Result<()> {
        self.track(path)?;
        write_atomic(path, contents)
    }

    pub fn remove(&mut self, path: &Path) -> Result<()> {
        self.track(path)?;
        remove_if_exists(path)
    }

    /// Move `from` to `to`. Returns false when `from` does not exist.
    pub fn relocate(&mut self, from: &Path, to: &Path) -> Result<bool> {
        let contents = match fs::read(from) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(PkiError::io(from, e)),
        };
        self.write(to, &contents)?;
        self.remove(from)?;
        Ok(true)
    }

    /// Restore every touched path, newest change first
    pub fn rollback(self) {
        for (path, previous) in self.touched.into_iter().rev() {
            let restored = match previous {
                Some(bytes) => write_atomic(&path, &bytes),
                None => remove_if_exists(&path),
            };
            if let Err(e) = restored {
                warn!(path = %path.display(), error = %e, "failed to roll back file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = PkiLayout::new("/srv/vpn");
        assert_eq!(layout.ca_key_path(), PathBuf::from("/srv/vpn/pki/ca.key"));
        assert_eq!(
            layout.bundle_path("alice", "-eu"),
            PathBuf::from("/srv/vpn/clients/alice-eu.visz")
        );
        assert_eq!(
            layout.server_profile_path(""),
            PathBuf::from("/srv/vpn/server/server.conf")
        );
    }

    #[test]
    fn test_load_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PkiLayout::new(dir.path());
        assert!(matches!(
            layout.load_config(),
            Err(PkiError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temporary files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_transaction_rollback_restores_files() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("existing.txt");
        let created = dir.path().join("created.txt");
        let moved = dir.path().join("moved.txt");
        fs::write(&existing, b"original").unwrap();

        let mut tx = FileTransaction::new();
        tx.write(&existing, b"changed").unwrap();
        tx.write(&created, b"new").unwrap();
        assert!(tx.relocate(&existing, &moved).unwrap());
        assert!(!existing.exists());
        tx.rollback();

        assert_eq!(fs::read(&existing).unwrap(), b"original");
        assert!(!created.exists());
        assert!(!moved.exists());
    }

    #[test]
    fn test_relocate_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = FileTransaction::new();
        let moved = tx
            .relocate(&dir.path().join("absent"), &dir.path().join("target"))
            .unwrap();
        assert!(!moved);
    }

    #[test]
    fn test_prepare_root_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            PkiLayout::new(&file).prepare_root(),
            Err(PkiError::Path { .. })
        ));
    }
}
