//! Error types for PKI lifecycle operations.
//!
//! Every lifecycle operation returns [`Result<T>`], which wraps [`PkiError`].
//! Crypto failures are carried as [`CryptoError`] so callers can branch on the
//! exact reason (unsupported curve, bad key size, library failure).

use std::path::PathBuf;

use thiserror::Error;

/// Error type for key, certificate, CRL and DH generation.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Algorithm name not recognised
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Curve is not valid for the selected algorithm
    #[error("curve {curve:?} is not supported for {algorithm}")]
    UnsupportedCurve { algorithm: String, curve: String },

    /// Key size outside the accepted range
    #[error("invalid key size: {0} bits")]
    InvalidKeySize(u32),

    /// Underlying OpenSSL failure
    #[error("crypto library failure: {0}")]
    Library(String),

    /// DER/PEM encoding failure while building a CRL
    #[error("encoding failure: {0}")]
    Encoding(String),
}

impl From<openssl::error::ErrorStack> for CryptoError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        CryptoError::Library(e.to_string())
    }
}

impl From<der::Error> for CryptoError {
    fn from(e: der::Error) -> Self {
        CryptoError::Encoding(e.to_string())
    }
}

/// Error type for all lifecycle operations.
///
/// # Example
///
/// ```no_run
/// use vpn_pki::error::PkiError;
/// use vpn_pki::lifecycle::PkiManager;
///
/// let mut manager = PkiManager::load("/srv/vpn")?;
/// match manager.revoke_client_identity("alice") {
///     Ok(record) => println!("revoked serial {}", record.serial),
///     Err(PkiError::NotFound(name)) => println!("no client named {name}"),
///     Err(PkiError::AlreadyRevoked(name)) => println!("{name} was already revoked"),
///     Err(e) => return Err(e),
/// }
/// # Ok::<(), PkiError>(())
/// ```
#[derive(Debug, Error)]
pub enum PkiError {
    /// Target directory missing, not a directory, or not writable
    #[error("path {path}: {reason}")]
    Path { path: PathBuf, reason: String },

    /// Operation attempted out of order
    #[error("invalid state: {0}")]
    State(String),

    /// Protected or duplicate client name
    #[error("name conflict: {0}")]
    NameConflict(String),

    /// Common name that cannot be used as a file name
    #[error("invalid common name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// No client identity with this name
    #[error("no client identity named {0:?}")]
    NotFound(String),

    /// Client identity already revoked
    #[error("client identity {0:?} is already revoked")]
    AlreadyRevoked(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// No configuration document at the given path
    #[error("no configuration found in {0}")]
    NotInitialized(PathBuf),

    /// File write or read failure
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration document could not be parsed or serialised
    #[error("invalid configuration document: {0}")]
    Config(String),

    /// Command-line value rejected
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PkiError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PkiError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<openssl::error::ErrorStack> for PkiError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        PkiError::Crypto(e.into())
    }
}

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, PkiError>;
