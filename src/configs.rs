//! Identity store and configuration model.
//!
//! [`PkiConfig`] is the persisted root object of a PKI instance. It owns the
//! serial counter, the protected-name set and every identity descriptor. Only
//! the lifecycle manager mutates it, always through load → mutate → save.

use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PkiError, Result};
use crate::pki_generator::{Algorithm, RevokedEntry};
use crate::subject::CertificateSubject;

/// Common name of the CA identity
pub const CA_NAME: &str = "ca";
/// Common name of the server identity (before the suffix)
pub const SERVER_NAME: &str = "server";
/// Names no client may take
pub const PROTECTED_NAMES: [&str; 2] = [CA_NAME, SERVER_NAME];

const CLOUDFLARE_DNS: [&str; 2] = ["1.1.1.1", "1.0.0.1"];
const GOOGLE_DNS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];
const OPEN_DNS: [&str; 2] = ["208.67.222.222", "208.67.220.220"];
const LOCAL_DNS: &str = "10.8.0.1";

/// Transport protocol for the VPN server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl Protocol {
    /// `proto` directive value for the server profile
    pub fn server_directive(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp-server",
        }
    }

    /// `proto` value on the client `remote` line
    pub fn client_directive(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp-client",
        }
    }
}

impl FromStr for Protocol {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            // tcp-client is accepted for older configurations
            "tcp" | "tcp-client" | "tcp-server" => Ok(Protocol::Tcp),
            other => Err(PkiError::InvalidInput(format!(
                "unknown protocol {:?}, expected udp or tcp",
                other
            ))),
        }
    }
}

/// Whether a revoked client's common name may be issued again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameReusePolicy {
    /// Names stay taken after revocation
    #[default]
    Reserved,
    /// A revoked name may be issued to a new identity with a fresh serial
    ReleaseOnRevoke,
}

/// Server network settings rendered into profiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefaults {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
    #[serde(default = "default_redirect")]
    pub redirect_gateway: bool,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            protocol: Protocol::default(),
            dns: default_dns(),
            redirect_gateway: default_redirect(),
        }
    }
}

fn default_address() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1194
}

fn default_dns() -> Vec<String> {
    CLOUDFLARE_DNS.iter().map(|s| s.to_string()).collect()
}

fn default_redirect() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_protected_names() -> Vec<String> {
    PROTECTED_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Resolve a DNS choice: a preset name or a comma-separated list of IPs.
///
/// Presets are `cloudflare`, `google`, `opendns`, `local` and `none`.
pub fn resolve_dns(choice: &str) -> Result<Vec<String>> {
    let preset: &[&str] = match choice.trim().to_ascii_lowercase().as_str() {
        "cloudflare" => &CLOUDFLARE_DNS,
        "google" => &GOOGLE_DNS,
        "opendns" => &OPEN_DNS,
        "local" => &[LOCAL_DNS],
        "none" | "." => &[],
        _ => {
            return choice
                .split(',')
                .map(str::trim)
                .map(|value| {
                    value
                        .parse::<IpAddr>()
                        .map(|ip| ip.to_string())
                        .map_err(|_| {
                            PkiError::InvalidInput(format!("{:?} is not a valid IP address", value))
                        })
                })
                .collect();
        }
    };
    Ok(preset.iter().map(|s| s.to_string()).collect())
}

/// Role of an identity within a PKI instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Ca,
    Server,
    Client,
}

/// Revocation state of an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Active,
    Revoked { revoked_at: DateTime<Utc> },
}

/// Persisted descriptor of an issued identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: String,
    pub role: Role,
    pub serial: u64,
    /// Serial of the signing CA, absent for the CA itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_serial: Option<u64>,
    pub issued_at: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Certificate file name under `pki/`
    pub certificate_file: String,
    /// Private key file name under `pki/`
    pub key_file: String,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl IdentityRecord {
    pub(crate) fn issue(
        name: &str,
        role: Role,
        serial: u64,
        issuer_serial: Option<u64>,
        valid_days: u32,
    ) -> Self {
        let issued_at = Utc::now();
        Self {
            name: name.to_string(),
            role,
            serial,
            issuer_serial,
            issued_at,
            not_after: issued_at + Duration::days(i64::from(valid_days)),
            certificate_file: format!("{}.crt", name),
            key_file: format!("{}.key", name),
            revoked: false,
            revoked_at: None,
        }
    }

    pub fn status(&self) -> RevocationStatus {
        match (self.revoked, self.revoked_at) {
            (true, Some(revoked_at)) => RevocationStatus::Revoked { revoked_at },
            // A flag without a timestamp comes from a hand-edited document
            (true, None) => RevocationStatus::Revoked {
                revoked_at: self.issued_at,
            },
            (false, _) => RevocationStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.revoked
    }
}

/// The CA identity plus the serials it has revoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaRecord {
    #[serde(default)]
    pub revoked_serials: Vec<u64>,
    pub identity: IdentityRecord,
}

/// Settings chosen when a PKI instance is initialised
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub key_size: u32,
    pub valid_days: u32,
    pub algorithm: Algorithm,
    /// Empty selects the algorithm default
    pub curve: String,
    pub suffix: String,
    /// CA subject; `None` uses the server address as common name
    pub subject: Option<CertificateSubject>,
    pub network: NetworkDefaults,
    pub dh_parameters: bool,
    pub name_reuse: NameReusePolicy,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            key_size: 2048,
            valid_days: 3650,
            algorithm: Algorithm::Rsa,
            curve: String::new(),
            suffix: String::new(),
            subject: None,
            network: NetworkDefaults::default(),
            dh_parameters: true,
            name_reuse: NameReusePolicy::Reserved,
        }
    }
}

/// Persisted root object of a PKI instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiConfig {
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub curve: String,
    pub key_size: u32,
    pub valid_days: u32,
    #[serde(default)]
    pub suffix: String,
    #[serde(default = "default_true")]
    pub dh_parameters: bool,
    #[serde(default)]
    pub name_reuse: NameReusePolicy,
    #[serde(default = "default_protected_names")]
    pub protected_names: Vec<String>,
    /// Last serial handed out; the next allocation returns `last_serial + 1`
    pub last_serial: u64,
    pub subject: CertificateSubject,
    #[serde(default)]
    pub network: NetworkDefaults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<IdentityRecord>,
    #[serde(default)]
    pub clients: Vec<IdentityRecord>,
}

impl PkiConfig {
    /// Fresh configuration with no identities and the counter at zero
    pub fn new(options: &InitOptions, curve: &str) -> Self {
        let subject = options
            .subject
            .clone()
            .unwrap_or_else(|| CertificateSubject::new(options.network.address.clone()));
        Self {
            algorithm: options.algorithm,
            curve: curve.to_string(),
            key_size: options.key_size,
            valid_days: options.valid_days,
            suffix: options.suffix.clone(),
            dh_parameters: options.dh_parameters,
            name_reuse: options.name_reuse,
            protected_names: default_protected_names(),
            last_serial: 0,
            subject,
            network: options.network.clone(),
            ca: None,
            server: None,
            clients: Vec::new(),
        }
    }

    pub fn from_toml(document: &str) -> Result<Self> {
        toml::from_str(document).map_err(|e| PkiError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PkiError::Config(e.to_string()))
    }

    /// Hand out the next serial. Serials start at 1 and never repeat.
    pub fn allocate_serial(&mut self) -> u64 {
        self.last_serial += 1;
        self.last_serial
    }

    /// Common name of the server identity, including the suffix
    pub fn server_common_name(&self) -> String {
        format!("{}{}", SERVER_NAME, self.suffix)
    }

    pub fn is_protected(&self, name: &str) -> bool {
        PROTECTED_NAMES.contains(&name) || self.protected_names.iter().any(|p| p == name)
    }

    /// Check a prospective client common name against the live collection
    pub fn validate_client_name(&self, name: &str) -> Result<()> {
        validate_file_safe(name)?;
        if self.is_protected(name) {
            return Err(PkiError::NameConflict(format!(
                "{:?} is reserved for the CA or server",
                name
            )));
        }
        if self.server.as_ref().is_some_and(|s| s.name == name) {
            return Err(PkiError::NameConflict(format!(
                "{:?} is the server identity's name",
                name
            )));
        }
        let taken = match self.name_reuse {
            NameReusePolicy::Reserved => self.clients.iter().any(|c| c.name == name),
            NameReusePolicy::ReleaseOnRevoke => {
                self.clients.iter().any(|c| c.name == name && c.is_active())
            }
        };
        if taken {
            return Err(PkiError::NameConflict(format!(
                "a client named {:?} already exists",
                name
            )));
        }
        Ok(())
    }

    /// Clients that have not been revoked, in issuance order
    pub fn active_clients(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.clients.iter().filter(|c| c.is_active())
    }

    /// The active record for `name`, if any
    pub fn active_client(&self, name: &str) -> Option<&IdentityRecord> {
        self.clients.iter().find(|c| c.name == name && c.is_active())
    }

    /// The most recently issued record for `name`, revoked or not
    pub fn latest_client(&self, name: &str) -> Option<&IdentityRecord> {
        self.clients.iter().rev().find(|c| c.name == name)
    }

    /// CRL entries for every serial the CA has revoked
    pub fn revoked_entries(&self) -> Vec<RevokedEntry> {
        let Some(ca) = &self.ca else {
            return Vec::new();
        };
        ca.revoked_serials
            .iter()
            .filter_map(|serial| {
                self.clients
                    .iter()
                    .find(|c| c.serial == *serial)
                    .map(|c| RevokedEntry {
                        serial: *serial,
                        revoked_at: c.revoked_at.unwrap_or(c.issued_at),
                    })
            })
            .collect()
    }
}

/// Check a file-name suffix. Empty is allowed; it is appended to server and
/// bundle file names, so it must not contain path separators.
pub fn validate_suffix(suffix: &str) -> Result<()> {
    if suffix
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(PkiError::InvalidInput(format!(
            "suffix {:?} must not contain path separators or control characters",
            suffix
        )));
    }
    Ok(())
}

/// Reject names that cannot safely become file names under `pki/`
fn validate_file_safe(name: &str) -> Result<()> {
    let invalid = |reason: &str| PkiError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.trim().is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(invalid("must not contain path separators or control characters"));
    }
    Ok(())
}
