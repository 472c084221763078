//! PKI lifecycle manager.
//!
//! [`PkiManager`] owns one PKI instance: its directory layout, its persisted
//! [`PkiConfig`] and the [`CryptoProvider`] used to produce keys,
//! certificates, CRLs and DH parameters.
//!
//! # Operation Order
//! ```text
//! initialize ──► create_dh_parameters ──► create_server_identity ──► export_server
//!                                     └─► create_client_identity ◄──► revoke_client_identity
//! ```
//!
//! Every mutating operation works on a copy of the configuration, stages its
//! file writes in a [`FileTransaction`] and commits by saving the
//! configuration. If anything fails before the save, the staged files are
//! rolled back and the in-memory configuration is left untouched.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::SecretBox;
use tracing::{debug, info, warn};

use crate::bundle::{self, BundleMetadata};
use crate::configs::{
    validate_suffix, CaRecord, IdentityRecord, InitOptions, PkiConfig, Role, CA_NAME,
};
use crate::error::{PkiError, Result};
use crate::pki_generator::{CertUsage, CryptoProvider, KeySpec, OpensslProvider};
use crate::storage::{write_atomic, FileTransaction, PkiLayout};
use crate::templates::{render_client_profile, render_server_profile, ClientProfile, ServerProfile};

/// Directory under `pki/` holding the material of revoked identities
const REVOKED_DIR: &str = "revoked";

/// Which client records a profile export may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportScope {
    /// Only an active identity; a revoked name is an error
    #[default]
    ActiveOnly,
    /// The most recent identity for the name, revoked or not
    IncludeRevoked,
}

/// Result of a successful client issuance
pub struct IssuedClient {
    pub identity: IdentityRecord,
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: SecretBox<Vec<u8>>,
    pub bundle_path: PathBuf,
}

impl fmt::Debug for IssuedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedClient")
            .field("identity", &self.identity)
            .field("bundle_path", &self.bundle_path)
            .field("private_key_pem", &"[REDACTED]")
            .finish()
    }
}

/// Freshly generated key and certificate, not yet on disk
struct IssuedMaterial {
    key_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    cert_der: Vec<u8>,
}

impl IssuedMaterial {
    fn new(key: &PKey<Private>, cert: &X509) -> Result<Self> {
        Ok(Self {
            key_pem: key.private_key_to_pem_pkcs8()?,
            cert_pem: cert.to_pem()?,
            cert_der: cert.to_der()?,
        })
    }
}

/// Lifecycle manager for one PKI instance
pub struct PkiManager<P: CryptoProvider = OpensslProvider> {
    layout: PkiLayout,
    config: PkiConfig,
    provider: P,
}

impl PkiManager<OpensslProvider> {
    /// Create a new PKI instance at `path` with an OpenSSL-backed provider
    pub fn initialize(path: impl AsRef<Path>, options: InitOptions) -> Result<Self> {
        Self::initialize_with(path, options, OpensslProvider)
    }

    /// Open an existing PKI instance
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(path, OpensslProvider)
    }

    /// [`PkiManager::initialize`], or pick up an earlier run that stopped
    /// after the CA was committed. See [`PkiManager::initialize_or_resume_with`].
    pub fn initialize_or_resume(
        path: impl AsRef<Path>,
        options: InitOptions,
    ) -> Result<(Self, bool)> {
        Self::initialize_or_resume_with(path, options, OpensslProvider)
    }
}

impl<P: CryptoProvider> PkiManager<P> {
    /// Create a new PKI instance: directories, CA key and certificate, and
    /// the configuration document.
    ///
    /// Key parameters are validated before anything touches the disk, so an
    /// unsupported curve or key size leaves `path` exactly as it was.
    ///
    /// # Errors
    ///
    /// * [`PkiError::Crypto`] - unsupported algorithm, curve or key size
    /// * [`PkiError::InvalidInput`] - zero validity, or a suffix with a path separator
    /// * [`PkiError::Path`] - `path` is not a writable directory
    /// * [`PkiError::State`] - `path` already holds a configuration
    pub fn initialize_with(
        path: impl AsRef<Path>,
        options: InitOptions,
        provider: P,
    ) -> Result<Self> {
        let spec = KeySpec::resolve(options.algorithm, options.key_size, &options.curve)?;
        if options.valid_days == 0 {
            return Err(PkiError::InvalidInput(
                "validity must be at least one day".to_string(),
            ));
        }
        validate_suffix(&options.suffix)?;

        let layout = PkiLayout::new(path.as_ref());
        layout.prepare_root()?;
        if layout.is_initialized() {
            return Err(PkiError::State(format!(
                "{} already holds a configuration",
                layout.root().display()
            )));
        }
        layout.create_directories()?;

        let mut config = PkiConfig::new(&options, spec.curve_name());
        let serial = config.allocate_serial();
        let ca_key = provider.generate_key_pair(&spec)?;
        let ca_cert = provider.self_sign(&ca_key, &config.subject, serial, config.valid_days)?;
        let material = IssuedMaterial::new(&ca_key, &ca_cert)?;

        let identity = IdentityRecord::issue(CA_NAME, Role::Ca, serial, None, config.valid_days);
        let mut tx = FileTransaction::new();
        let staged = stage_identity(&layout, &mut tx, &identity, &material);
        config.ca = Some(CaRecord {
            revoked_serials: Vec::new(),
            identity,
        });
        let staged = staged.and_then(|()| layout.save_config(&config));
        if let Err(e) = staged {
            tx.rollback();
            return Err(e);
        }

        info!(
            path = %layout.root().display(),
            algorithm = %config.algorithm,
            curve = %config.curve,
            serial,
            "initialized certificate authority"
        );
        Ok(Self {
            layout,
            config,
            provider,
        })
    }

    /// Initialize `path`, or reopen it when a previous initialization
    /// committed the CA but never issued the server identity.
    ///
    /// Returns the manager and whether an existing instance was resumed. The
    /// resumed instance keeps its stored settings; `options` only apply to a
    /// fresh one. An instance that already has a server is a
    /// [`PkiError::State`] error.
    pub fn initialize_or_resume_with(
        path: impl AsRef<Path>,
        options: InitOptions,
        provider: P,
    ) -> Result<(Self, bool)> {
        let layout = PkiLayout::new(path.as_ref());
        if !layout.is_initialized() {
            return Self::initialize_with(path, options, provider).map(|manager| (manager, false));
        }
        let manager = Self::load_with(path, provider)?;
        if manager.config.server.is_some() {
            return Err(PkiError::State(format!(
                "{} already holds a configuration",
                layout.root().display()
            )));
        }
        warn!(
            path = %layout.root().display(),
            "resuming initialization without a server identity"
        );
        Ok((manager, true))
    }

    /// Open the PKI instance at `path` using `provider`
    pub fn load_with(path: impl AsRef<Path>, provider: P) -> Result<Self> {
        let layout = PkiLayout::new(path.as_ref());
        let config = layout.load_config()?;
        debug!(
            path = %layout.root().display(),
            clients = config.clients.len(),
            last_serial = config.last_serial,
            "loaded configuration"
        );
        Ok(Self {
            layout,
            config,
            provider,
        })
    }

    pub fn config(&self) -> &PkiConfig {
        &self.config
    }

    pub fn layout(&self) -> &PkiLayout {
        &self.layout
    }

    /// Every client record, revoked ones included, in issuance order
    pub fn clients(&self) -> &[IdentityRecord] {
        &self.config.clients
    }

    pub fn active_clients(&self) -> Vec<&IdentityRecord> {
        self.config.active_clients().collect()
    }

    /// Persist the current configuration
    pub fn save(&self) -> Result<()> {
        self.layout.save_config(&self.config)
    }

    /// Generate `pki/dh.pem`. Returns `false` when the instance was created
    /// with DH parameters disabled.
    pub fn create_dh_parameters(&self) -> Result<bool> {
        if !self.config.dh_parameters {
            debug!("DH parameters disabled, skipping");
            return Ok(false);
        }
        let bits = self.config.key_size;
        info!(bits, "generating DH parameters, this may take a while");
        let pem = self.provider.generate_dh_params(bits)?;
        write_atomic(&self.layout.dh_path(), &pem)?;
        info!(path = %self.layout.dh_path().display(), "wrote DH parameters");
        Ok(true)
    }

    /// Issue the server identity. With `reissue` an existing server identity
    /// is replaced; its old files are overwritten.
    pub fn create_server_identity(&mut self, reissue: bool) -> Result<IdentityRecord> {
        if self.config.server.is_some() && !reissue {
            return Err(PkiError::State(
                "a server identity already exists".to_string(),
            ));
        }
        let (ca_key, ca_cert) = self.load_ca()?;

        let mut next = self.config.clone();
        let name = next.server_common_name();
        let serial = next.allocate_serial();
        let material = self.issue_material(&ca_key, &ca_cert, &name, serial, CertUsage::Server)?;
        let identity = IdentityRecord::issue(
            &name,
            Role::Server,
            serial,
            Some(self.ca_serial()?),
            next.valid_days,
        );

        let mut tx = FileTransaction::new();
        let staged = stage_identity(&self.layout, &mut tx, &identity, &material);
        next.server = Some(identity.clone());
        self.commit(next, tx, staged)?;

        info!(name = %identity.name, serial, reissue, "issued server identity");
        Ok(identity)
    }

    /// Issue a client identity and package its bundle.
    ///
    /// # Errors
    ///
    /// * [`PkiError::InvalidName`] - `name` cannot be used as a file name
    /// * [`PkiError::NameConflict`] - `name` is protected or already taken
    /// * [`PkiError::State`] - no CA exists yet
    pub fn create_client_identity(&mut self, name: &str) -> Result<IssuedClient> {
        self.config.validate_client_name(name)?;
        let (ca_key, ca_cert) = self.load_ca()?;

        let mut next = self.config.clone();
        let serial = next.allocate_serial();
        let material = self.issue_material(&ca_key, &ca_cert, name, serial, CertUsage::Client)?;
        let identity = IdentityRecord::issue(
            name,
            Role::Client,
            serial,
            Some(self.ca_serial()?),
            next.valid_days,
        );
        let bundle_path = self.layout.bundle_path(name, &next.suffix);

        let mut tx = FileTransaction::new();
        let staged = stage_identity(&self.layout, &mut tx, &identity, &material)
            .and_then(|()| self.stage_bundle(&mut tx, &next, &identity, &material, &bundle_path));
        next.clients.push(identity.clone());
        self.commit(next, tx, staged)?;

        info!(name, serial, bundle = %bundle_path.display(), "issued client identity");
        Ok(IssuedClient {
            identity,
            certificate_pem: material.cert_pem,
            private_key_pem: SecretBox::new(Box::new(material.key_pem)),
            bundle_path,
        })
    }

    /// Revoke the active identity named `name` and regenerate the CRL.
    ///
    /// The revoked certificate and key move to `pki/revoked/<serial>.*` so the
    /// name can later be reissued without clobbering them, and the client's
    /// bundle is deleted. A failure leaves the previous CRL in place.
    pub fn revoke_client_identity(&mut self, name: &str) -> Result<IdentityRecord> {
        if !self.config.clients.iter().any(|c| c.name == name) {
            return Err(PkiError::NotFound(name.to_string()));
        }
        let index = self
            .config
            .clients
            .iter()
            .position(|c| c.name == name && c.is_active())
            .ok_or_else(|| PkiError::AlreadyRevoked(name.to_string()))?;
        let (ca_key, ca_cert) = self.load_ca()?;

        let mut next = self.config.clone();
        let revoked_dir = self.layout.pki_file(REVOKED_DIR);
        let record = &mut next.clients[index];
        let old_cert = self.layout.pki_file(&record.certificate_file);
        let old_key = self.layout.pki_file(&record.key_file);
        record.revoked = true;
        record.revoked_at = Some(Utc::now());
        record.certificate_file = format!("{}/{}.crt", REVOKED_DIR, record.serial);
        record.key_file = format!("{}/{}.key", REVOKED_DIR, record.serial);
        let record = record.clone();

        match next.ca.as_mut() {
            Some(ca) => ca.revoked_serials.push(record.serial),
            None => {
                return Err(PkiError::State(
                    "no certificate authority in configuration".to_string(),
                ))
            }
        }
        let crl = self.provider.generate_crl(
            &ca_key,
            &ca_cert,
            &next.revoked_entries(),
            next.valid_days,
        )?;

        let mut tx = FileTransaction::new();
        let staged = fs::create_dir_all(&revoked_dir)
            .map_err(|e| PkiError::io(&revoked_dir, e))
            .and_then(|()| {
                let new_cert = self.layout.pki_file(&record.certificate_file);
                let new_key = self.layout.pki_file(&record.key_file);
                if !tx.relocate(&old_cert, &new_cert)? {
                    warn!(path = %old_cert.display(), "revoked certificate file missing");
                }
                if !tx.relocate(&old_key, &new_key)? {
                    warn!(path = %old_key.display(), "revoked key file missing");
                }
                tx.write(&self.layout.crl_path(), &crl)?;
                tx.remove(&self.layout.bundle_path(name, &next.suffix))
            });
        self.commit(next, tx, staged)?;

        info!(name, serial = record.serial, "revoked client identity");
        Ok(record)
    }

    /// Rewrite `pki/crl.pem` from the persisted revocation list, refreshing
    /// its update times
    pub fn regenerate_crl(&self) -> Result<()> {
        let (ca_key, ca_cert) = self.load_ca()?;
        let entries = self.config.revoked_entries();
        let crl =
            self.provider
                .generate_crl(&ca_key, &ca_cert, &entries, self.config.valid_days)?;
        write_atomic(&self.layout.crl_path(), &crl)?;
        info!(revoked = entries.len(), "regenerated CRL");
        Ok(())
    }

    /// Render the server profile with CA, certificate, key, DH and CRL inline
    pub fn server_profile(&self) -> Result<String> {
        let server = self
            .config
            .server
            .as_ref()
            .ok_or_else(|| PkiError::State("no server identity has been issued".to_string()))?;
        let ca_pem = self.read_pem(&self.layout.ca_cert_path())?;
        let cert_pem = self.read_pem(&self.layout.pki_file(&server.certificate_file))?;
        let key_pem = self.read_pem(&self.layout.pki_file(&server.key_file))?;
        let dh_pem = if self.config.dh_parameters {
            self.read_optional_pem(&self.layout.dh_path())?
        } else {
            None
        };
        let crl_pem = self.read_optional_pem(&self.layout.crl_path())?;

        Ok(render_server_profile(&ServerProfile {
            network: &self.config.network,
            algorithm: self.config.algorithm,
            curve: &self.config.curve,
            suffix: &self.config.suffix,
            ca_pem: &ca_pem,
            cert_pem: &cert_pem,
            key_pem: &key_pem,
            dh_pem: dh_pem.as_deref(),
            crl_pem: crl_pem.as_deref(),
        }))
    }

    /// Render the profile of client `name`
    pub fn client_profile(&self, name: &str, scope: ExportScope) -> Result<String> {
        let record = match scope {
            ExportScope::ActiveOnly => match self.config.active_client(name) {
                Some(record) => record,
                None if self.config.latest_client(name).is_some() => {
                    return Err(PkiError::AlreadyRevoked(name.to_string()))
                }
                None => return Err(PkiError::NotFound(name.to_string())),
            },
            ExportScope::IncludeRevoked => self
                .config
                .latest_client(name)
                .ok_or_else(|| PkiError::NotFound(name.to_string()))?,
        };
        let ca_pem = self.read_pem(&self.layout.ca_cert_path())?;
        let cert_pem = self.read_pem(&self.layout.pki_file(&record.certificate_file))?;
        let key_pem = self.read_pem(&self.layout.pki_file(&record.key_file))?;
        Ok(render_client_profile(&ClientProfile {
            name,
            network: &self.config.network,
            ca_pem: &ca_pem,
            cert_pem: &cert_pem,
            key_pem: &key_pem,
        }))
    }

    /// Write the server profile to `server/server<suffix>.conf`
    pub fn export_server(&self) -> Result<PathBuf> {
        let profile = self.server_profile()?;
        let dir = self.layout.server_dir();
        fs::create_dir_all(&dir).map_err(|e| PkiError::io(&dir, e))?;
        let path = self.layout.server_profile_path(&self.config.suffix);
        write_atomic(&path, profile.as_bytes())?;
        info!(path = %path.display(), "exported server profile");
        Ok(path)
    }

    /// Save `next` and adopt it, or roll back `tx` if staging or the save
    /// failed
    fn commit(&mut self, next: PkiConfig, tx: FileTransaction, staged: Result<()>) -> Result<()> {
        match staged.and_then(|()| self.layout.save_config(&next)) {
            Ok(()) => {
                self.config = next;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "operation failed, rolling back staged files");
                tx.rollback();
                Err(e)
            }
        }
    }

    fn ca_serial(&self) -> Result<u64> {
        self.config
            .ca
            .as_ref()
            .map(|ca| ca.identity.serial)
            .ok_or_else(|| PkiError::State("no certificate authority in configuration".to_string()))
    }

    fn load_ca(&self) -> Result<(PKey<Private>, X509)> {
        self.ca_serial()?;
        let key_pem = self.layout.read(&self.layout.ca_key_path())?;
        let cert_pem = self.layout.read(&self.layout.ca_cert_path())?;
        let key = PKey::private_key_from_pem(&key_pem)?;
        let cert = X509::from_pem(&cert_pem)?;
        Ok((key, cert))
    }

    fn key_spec(&self) -> Result<KeySpec> {
        Ok(KeySpec::resolve(
            self.config.algorithm,
            self.config.key_size,
            &self.config.curve,
        )?)
    }

    /// Key pair plus CA-signed certificate for `common_name`
    fn issue_material(
        &self,
        ca_key: &PKey<Private>,
        ca_cert: &X509,
        common_name: &str,
        serial: u64,
        usage: CertUsage,
    ) -> Result<IssuedMaterial> {
        let spec = self.key_spec()?;
        let key = self.provider.generate_key_pair(&spec)?;
        let subject = self.config.subject.with_common_name(common_name);
        let csr = self.provider.build_csr(&subject, &key)?;
        let cert = self.provider.sign_csr(
            ca_key,
            ca_cert,
            &csr,
            serial,
            self.config.valid_days,
            usage,
        )?;
        IssuedMaterial::new(&key, &cert)
    }

    fn stage_bundle(
        &self,
        tx: &mut FileTransaction,
        config: &PkiConfig,
        identity: &IdentityRecord,
        material: &IssuedMaterial,
        bundle_path: &Path,
    ) -> Result<()> {
        let ca_pem = self.read_pem(&self.layout.ca_cert_path())?;
        let profile = render_client_profile(&ClientProfile {
            name: &identity.name,
            network: &config.network,
            ca_pem: &ca_pem,
            cert_pem: &String::from_utf8_lossy(&material.cert_pem),
            key_pem: &String::from_utf8_lossy(&material.key_pem),
        });
        let metadata = BundleMetadata {
            name: identity.name.clone(),
            created_at: identity.issued_at,
            algorithm: config.algorithm,
            serial: identity.serial,
            fingerprint_sha256: bundle::fingerprint(&material.cert_der),
            remote: format!("{}:{}", config.network.address, config.network.port),
        };
        tx.track(bundle_path)?;
        bundle::package_client(bundle_path, &metadata, &profile)
    }

    fn read_pem(&self, path: &Path) -> Result<String> {
        let bytes = self.layout.read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_optional_pem(&self, path: &Path) -> Result<Option<String>> {
        if path.is_file() {
            self.read_pem(path).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Write an identity's certificate and key under `pki/`
fn stage_identity(
    layout: &PkiLayout,
    tx: &mut FileTransaction,
    identity: &IdentityRecord,
    material: &IssuedMaterial,
) -> Result<()> {
    tx.write(&layout.pki_file(&identity.certificate_file), &material.cert_pem)?;
    tx.write(&layout.pki_file(&identity.key_file), &material.key_pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::NameReusePolicy;
    use crate::error::CryptoError;
    use crate::pki_generator::{Algorithm, RevokedEntry};
    use crate::subject::CertificateSubject;
    use openssl::pkey::PKeyRef;
    use openssl::x509::{X509Ref, X509Req, X509ReqRef};
    use std::cell::Cell;

    fn fast_options() -> InitOptions {
        InitOptions {
            algorithm: Algorithm::Ecdsa,
            curve: "prime256v1".to_string(),
            valid_days: 30,
            dh_parameters: false,
            ..InitOptions::default()
        }
    }

    /// Delegates to OpenSSL but fails CRL generation on demand
    #[derive(Default)]
    struct FlakyProvider {
        fail_crl: Cell<bool>,
    }

    impl CryptoProvider for FlakyProvider {
        fn generate_key_pair(&self, spec: &KeySpec) -> std::result::Result<PKey<Private>, CryptoError> {
            OpensslProvider.generate_key_pair(spec)
        }

        fn self_sign(
            &self,
            key: &PKeyRef<Private>,
            subject: &CertificateSubject,
            serial: u64,
            valid_days: u32,
        ) -> std::result::Result<X509, CryptoError> {
            OpensslProvider.self_sign(key, subject, serial, valid_days)
        }

        fn build_csr(
            &self,
            subject: &CertificateSubject,
            key: &PKeyRef<Private>,
        ) -> std::result::Result<X509Req, CryptoError> {
            OpensslProvider.build_csr(subject, key)
        }

        fn sign_csr(
            &self,
            ca_key: &PKeyRef<Private>,
            ca_cert: &X509Ref,
            csr: &X509ReqRef,
            serial: u64,
            valid_days: u32,
            usage: CertUsage,
        ) -> std::result::Result<X509, CryptoError> {
            OpensslProvider.sign_csr(ca_key, ca_cert, csr, serial, valid_days, usage)
        }

        fn generate_crl(
            &self,
            ca_key: &PKeyRef<Private>,
            ca_cert: &X509Ref,
            revoked: &[RevokedEntry],
            valid_days: u32,
        ) -> std::result::Result<Vec<u8>, CryptoError> {
            if self.fail_crl.get() {
                return Err(CryptoError::Library("injected CRL failure".to_string()));
            }
            OpensslProvider.generate_crl(ca_key, ca_cert, revoked, valid_days)
        }

        fn generate_dh_params(&self, bits: u32) -> std::result::Result<Vec<u8>, CryptoError> {
            OpensslProvider.generate_dh_params(bits)
        }

        fn supported_curves(&self, algorithm: Algorithm) -> Vec<&'static str> {
            OpensslProvider.supported_curves(algorithm)
        }
    }

    #[test]
    fn test_initialize_writes_ca_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PkiManager::initialize(dir.path(), fast_options()).unwrap();

        assert!(manager.layout().ca_cert_path().is_file());
        assert!(manager.layout().ca_key_path().is_file());
        assert!(manager.layout().config_path().is_file());
        assert_eq!(manager.config().last_serial, 1);
        assert_eq!(manager.config().ca.as_ref().unwrap().identity.serial, 1);
    }

    #[test]
    fn test_initialize_twice_is_state_error() {
        let dir = tempfile::tempdir().unwrap();
        PkiManager::initialize(dir.path(), fast_options()).unwrap();
        assert!(matches!(
            PkiManager::initialize(dir.path(), fast_options()),
            Err(PkiError::State(_))
        ));
    }

    #[test]
    fn test_suffix_with_separator_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("pki-root");
        let options = InitOptions {
            suffix: "../escape".to_string(),
            ..fast_options()
        };
        assert!(matches!(
            PkiManager::initialize(&root, options),
            Err(PkiError::InvalidInput(_))
        ));
        assert!(!root.exists());
    }

    #[test]
    fn test_client_before_ca_is_state_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PkiManager::initialize(dir.path(), fast_options()).unwrap();
        let mut config = manager.config().clone();
        config.ca = None;
        let mut broken = PkiManager {
            layout: manager.layout().clone(),
            config,
            provider: OpensslProvider,
        };
        assert!(matches!(
            broken.create_client_identity("alice"),
            Err(PkiError::State(_))
        ));
    }

    #[test]
    fn test_server_requires_reissue_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PkiManager::initialize(dir.path(), fast_options()).unwrap();
        let first = manager.create_server_identity(false).unwrap();
        assert_eq!(first.serial, 2);
        assert!(matches!(
            manager.create_server_identity(false),
            Err(PkiError::State(_))
        ));
        let second = manager.create_server_identity(true).unwrap();
        assert_eq!(second.serial, 3);
        assert_eq!(manager.config().server.as_ref().unwrap().serial, 3);
    }

    #[test]
    fn test_failed_revocation_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            PkiManager::initialize_with(dir.path(), fast_options(), FlakyProvider::default())
                .unwrap();
        manager.create_client_identity("alice").unwrap();
        let before = manager.config().clone();
        let cert_path = manager.layout().pki_file("alice.crt");
        let bundle_path = manager.layout().bundle_path("alice", "");

        manager.provider.fail_crl.set(true);
        assert!(matches!(
            manager.revoke_client_identity("alice"),
            Err(PkiError::Crypto(CryptoError::Library(_)))
        ));

        assert_eq!(manager.config(), &before);
        assert_eq!(manager.layout().load_config().unwrap(), before);
        assert!(cert_path.is_file());
        assert!(bundle_path.is_file());
        assert!(!manager.layout().crl_path().exists());
    }

    #[test]
    fn test_failed_save_rolls_back_client_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PkiManager::initialize(dir.path(), fast_options()).unwrap();
        // A directory in place of the config file makes the save fail
        let config_path = manager.layout().config_path();
        fs::remove_file(&config_path).unwrap();
        fs::create_dir(&config_path).unwrap();

        assert!(manager.create_client_identity("alice").is_err());
        assert!(!manager.layout().pki_file("alice.crt").exists());
        assert!(!manager.layout().pki_file("alice.key").exists());
        assert!(!manager.layout().bundle_path("alice", "").exists());
        assert!(manager.clients().is_empty());
        assert_eq!(manager.config().last_serial, 1);
    }

    #[test]
    fn test_revoked_material_moves_aside() {
        let dir = tempfile::tempdir().unwrap();
        let options = InitOptions {
            name_reuse: NameReusePolicy::ReleaseOnRevoke,
            ..fast_options()
        };
        let mut manager = PkiManager::initialize(dir.path(), options).unwrap();
        manager.create_client_identity("alice").unwrap();
        let revoked = manager.revoke_client_identity("alice").unwrap();

        assert_eq!(revoked.certificate_file, "revoked/2.crt");
        assert!(manager.layout().pki_file("revoked/2.crt").is_file());
        assert!(!manager.layout().pki_file("alice.crt").exists());

        let reissued = manager.create_client_identity("alice").unwrap();
        assert_eq!(reissued.identity.serial, 3);
        assert!(manager.layout().pki_file("alice.crt").is_file());
        assert!(manager
            .client_profile("alice", ExportScope::ActiveOnly)
            .is_ok());
    }

    #[test]
    fn test_client_profile_scope() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PkiManager::initialize(dir.path(), fast_options()).unwrap();
        manager.create_client_identity("bob").unwrap();
        manager.revoke_client_identity("bob").unwrap();

        assert!(matches!(
            manager.client_profile("bob", ExportScope::ActiveOnly),
            Err(PkiError::AlreadyRevoked(_))
        ));
        let profile = manager
            .client_profile("bob", ExportScope::IncludeRevoked)
            .unwrap();
        assert!(profile.contains("<cert>"));
        assert!(matches!(
            manager.client_profile("carol", ExportScope::IncludeRevoked),
            Err(PkiError::NotFound(_))
        ));
    }

    #[test]
    fn test_issued_client_debug_redacts_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PkiManager::initialize(dir.path(), fast_options()).unwrap();
        let issued = manager.create_client_identity("alice").unwrap();
        let rendered = format!("{:?}", issued);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_dh_disabled_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PkiManager::initialize(dir.path(), fast_options()).unwrap();
        assert!(!manager.create_dh_parameters().unwrap());
        assert!(!manager.layout().dh_path().exists());
    }
}
