//! Client bundle packaging.
//!
//! A bundle is a gzip-compressed tar archive holding one directory named after
//! the client, with the rendered profile (`config.conf`) and a small JSON
//! metadata document (`metadata.json`). Archives are built in a temporary
//! file next to the target and renamed over it only once complete, so an
//! existing bundle is never left half-written.

use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::{Builder, Header};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{PkiError, Result};
use crate::pki_generator::Algorithm;

pub const PROFILE_FILE: &str = "config.conf";
pub const METADATA_FILE: &str = "metadata.json";

/// Descriptive document shipped next to the profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub algorithm: Algorithm,
    pub serial: u64,
    /// Colon-separated SHA-256 of the certificate DER
    pub fingerprint_sha256: String,
    pub remote: String,
}

/// One file inside the bundle directory
#[derive(Debug, Clone, Copy)]
pub struct BundleEntry<'a> {
    pub file_name: &'a str,
    pub contents: &'a [u8],
    pub mode: u32,
}

/// SHA-256 fingerprint in `AA:BB:..` form
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Write `entries` under `root/` into a tar.gz at `target`, atomically
pub fn package(
    target: &Path,
    root: &str,
    entries: &[BundleEntry<'_>],
    mtime: DateTime<Utc>,
) -> Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let temp = NamedTempFile::new_in(dir).map_err(|e| PkiError::io(dir, e))?;

    let encoder = GzEncoder::new(temp, Compression::default());
    let mut tar_builder = Builder::new(encoder);
    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_size(entry.contents.len() as u64);
        header.set_mode(entry.mode);
        header.set_mtime(mtime.timestamp().max(0) as u64);
        header.set_cksum();
        let entry_path = format!("{}/{}", root, entry.file_name);
        tar_builder
            .append_data(&mut header, &entry_path, entry.contents)
            .map_err(|e| PkiError::io(target, e))?;
    }
    let encoder = tar_builder
        .into_inner()
        .map_err(|e| PkiError::io(target, e))?;
    let temp = encoder.finish().map_err(|e| PkiError::io(target, e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| PkiError::io(target, e))?;
    temp.persist(target)
        .map_err(|e| PkiError::io(target, e.error))?;

    debug!(path = %target.display(), entries = entries.len(), "wrote bundle");
    Ok(())
}

/// Package a client profile with its metadata document
pub fn package_client(target: &Path, metadata: &BundleMetadata, profile: &str) -> Result<()> {
    let metadata_json = serde_json::to_vec_pretty(metadata)
        .map_err(|e| PkiError::Config(format!("Failed to serialize bundle metadata: {}", e)))?;
    let entries = [
        BundleEntry {
            file_name: PROFILE_FILE,
            contents: profile.as_bytes(),
            // The profile embeds the private key
            mode: 0o600,
        },
        BundleEntry {
            file_name: METADATA_FILE,
            contents: &metadata_json,
            mode: 0o644,
        },
    ];
    package(target, &metadata.name, &entries, metadata.created_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs::File;
    use std::io::Read;
    use tar::Archive;

    fn read_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents).unwrap();
                (name, contents)
            })
            .collect()
    }

    fn metadata() -> BundleMetadata {
        BundleMetadata {
            name: "alice".to_string(),
            created_at: Utc::now(),
            algorithm: Algorithm::Rsa,
            serial: 3,
            fingerprint_sha256: fingerprint(b"cert"),
            remote: "vpn.example.com:1194".to_string(),
        }
    }

    #[test]
    fn test_package_client_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("alice.visz");
        package_client(&target, &metadata(), "remote vpn.example.com\n").unwrap();

        let entries = read_entries(&target);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "alice/config.conf");
        assert_eq!(entries[0].1, b"remote vpn.example.com\n");
        assert_eq!(entries[1].0, "alice/metadata.json");
        let parsed: BundleMetadata = serde_json::from_slice(&entries[1].1).unwrap();
        assert_eq!(parsed, metadata_with_time(parsed.created_at));
    }

    fn metadata_with_time(created_at: DateTime<Utc>) -> BundleMetadata {
        BundleMetadata {
            created_at,
            ..metadata()
        }
    }

    #[test]
    fn test_package_replaces_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("alice.visz");
        std::fs::write(&target, b"old").unwrap();
        package_client(&target, &metadata(), "new profile").unwrap();

        let entries = read_entries(&target);
        assert_eq!(entries[0].1, b"new profile");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_package_fails_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("alice.visz");
        assert!(matches!(
            package_client(&target, &metadata(), "profile"),
            Err(PkiError::Io { .. })
        ));
        assert!(!target.exists());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"abc");
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.starts_with("BA:78:16:BF"));
    }
}
