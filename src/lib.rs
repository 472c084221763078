//! vpn-pki - Local Certificate Authority and OpenVPN Profile Library
//!
//! Bootstraps a private CA on the local filesystem, issues server and client
//! identities signed by it, revokes client identities behind a CRL and packages
//! every client into a self-contained profile bundle.
//!
//! # Overview
//!
//! ```text
//! CA (self-signed, serial 1)
//!   ├── Server (serverAuth, serial 2)
//!   └── Client ... (clientAuth, serial 3, 4, ...)
//! ```
//!
//! All state lives in one directory:
//!
//! ```text
//! config.toml                      identity store and serial counter
//! pki/ca.crt ca.key dh.pem crl.pem
//! pki/<name>.crt <name>.key        active identities
//! pki/revoked/<serial>.crt .key    revoked identities
//! clients/<name><suffix>.visz      client bundles (tar.gz)
//! server/server<suffix>.conf       server profile
//! ```
//!
//! # Features
//!
//! - **Monotonic Serials**: the counter lives in the configuration and is never
//!   reused, also across revocation and reissue
//! - **Protected Names**: `ca` and `server` can never be issued to a client
//! - **Transactional Operations**: staged files are rolled back unless the
//!   configuration save succeeds
//! - **RSA, ECDSA and EdDSA**: one algorithm per instance, chosen at init
//!
//! # Quick Start
//!
//! ```no_run
//! use vpn_pki::configs::InitOptions;
//! use vpn_pki::lifecycle::{ExportScope, PkiManager};
//!
//! fn main() -> vpn_pki::error::Result<()> {
//!     let mut manager = PkiManager::initialize("/srv/vpn", InitOptions::default())?;
//!     manager.create_dh_parameters()?;
//!     manager.create_server_identity(false)?;
//!     manager.export_server()?;
//!
//!     let alice = manager.create_client_identity("alice")?;
//!     println!("bundle at {}", alice.bundle_path.display());
//!
//!     manager.revoke_client_identity("alice")?;
//!     let profile = manager.client_profile("alice", ExportScope::IncludeRevoked)?;
//!     println!("{}", profile);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`lifecycle`]: the manager, the only code that mutates the configuration
//! - [`configs`]: persisted configuration model and name rules
//! - [`pki_generator`]: [`pki_generator::CryptoProvider`] and its OpenSSL implementation
//! - [`storage`]: directory layout, atomic writes and file transactions
//! - [`templates`]: server and client profile text
//! - [`bundle`]: tar.gz packaging of client profiles
//! - [`cli`]: command-line modes and options

pub mod bundle;
pub mod cli;
pub mod configs;
pub mod error;
pub mod lifecycle;
pub mod pki_generator;
pub mod storage;
pub mod subject;
pub mod templates;
