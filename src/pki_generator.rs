//! Crypto Provider Module
//!
//! Key, certificate, CRL and DH parameter generation for the lifecycle
//! manager. Everything here is stateless: inputs are OpenSSL key and
//! certificate handles plus plain values, outputs are new handles or PEM bytes.
//!
//! # Issued Certificate Properties
//! ```text
//! CA (self-signed)          BasicConstraints CA=true, keyCertSign + cRLSign
//!   ├── Server              serverAuth, CA=false
//!   └── Client              clientAuth, CA=false
//! ```
//!
//! - **Version**: X.509v3 with SubjectKeyIdentifier and AuthorityKeyIdentifier
//! - **Signature**: SHA-256 for RSA and ECDSA, pure EdDSA for Ed25519/Ed448
//! - **Serial Number**: allocated by the caller, never random
//!
//! CRLs are assembled as `TBSCertList` structures with `x509-cert` and signed
//! with the CA key through OpenSSL, since OpenSSL's CRL builder is not exposed
//! by the `openssl` crate.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use der::asn1::{BitString, GeneralizedTime, ObjectIdentifier, UtcTime};
use der::{Any, Decode, Encode, Tag};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::dh::Dh;
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509Crl, X509Ref, X509Req, X509ReqBuilder, X509ReqRef, X509};
use serde::{Deserialize, Serialize};
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::time::Time;

use crate::error::CryptoError;
use crate::subject::CertificateSubject;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const CSR_VERSION_1: i32 = 0;
const RSA_KEY_SIZE_MIN: u32 = 1024;
const RSA_KEY_SIZE_MAX: u32 = 16384;
const DH_GENERATOR: u32 = 2;
const SECONDS_PER_DAY: u64 = 86_400;

const OID_SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const OID_ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
const OID_ED448: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.113");

/// Named curves accepted for ECDSA, aliases included.
const EC_CURVES: &[(&str, Nid)] = &[
    ("prime256v1", Nid::X9_62_PRIME256V1),
    ("secp256r1", Nid::X9_62_PRIME256V1),
    ("secp224r1", Nid::SECP224R1),
    ("secp384r1", Nid::SECP384R1),
    ("secp521r1", Nid::SECP521R1),
    ("secp256k1", Nid::SECP256K1),
];

const ED_CURVES: &[&str] = &["ED25519", "ED448"];

/// Key algorithm for every identity of a PKI instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Rsa,
    Ecdsa,
    Eddsa,
}

impl Algorithm {
    /// Curve used when none is given on the command line
    pub fn default_curve(self) -> &'static str {
        match self {
            Algorithm::Rsa => "",
            Algorithm::Ecdsa => "secp384r1",
            Algorithm::Eddsa => "ED25519",
        }
    }

    pub fn is_elliptic(self) -> bool {
        !matches!(self, Algorithm::Rsa)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Rsa => "rsa",
            Algorithm::Ecdsa => "ecdsa",
            Algorithm::Eddsa => "eddsa",
        };
        f.write_str(name)
    }
}

impl FromStr for Algorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rsa" => Ok(Algorithm::Rsa),
            "ecdsa" => Ok(Algorithm::Ecdsa),
            "eddsa" => Ok(Algorithm::Eddsa),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A validated algorithm/size/curve combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Rsa { bits: u32 },
    Ecdsa { curve: &'static str, nid: Nid },
    Ed25519,
    Ed448,
}

impl KeySpec {
    /// Validate a combination before any key material is generated.
    ///
    /// An empty `curve` selects the algorithm default. Curve names compare
    /// case-insensitively; RSA ignores the curve.
    pub fn resolve(algorithm: Algorithm, key_size: u32, curve: &str) -> Result<Self, CryptoError> {
        let curve = if curve.is_empty() {
            algorithm.default_curve()
        } else {
            curve
        };
        match algorithm {
            Algorithm::Rsa => {
                if !(RSA_KEY_SIZE_MIN..=RSA_KEY_SIZE_MAX).contains(&key_size) {
                    return Err(CryptoError::InvalidKeySize(key_size));
                }
                Ok(KeySpec::Rsa { bits: key_size })
            }
            Algorithm::Ecdsa => EC_CURVES
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(curve))
                .map(|&(name, nid)| KeySpec::Ecdsa { curve: name, nid })
                .ok_or_else(|| unsupported_curve(algorithm, curve)),
            Algorithm::Eddsa => {
                if curve.eq_ignore_ascii_case("ED25519") {
                    Ok(KeySpec::Ed25519)
                } else if curve.eq_ignore_ascii_case("ED448") {
                    Ok(KeySpec::Ed448)
                } else {
                    Err(unsupported_curve(algorithm, curve))
                }
            }
        }
    }

    /// Canonical curve name, empty for RSA
    pub fn curve_name(&self) -> &'static str {
        match self {
            KeySpec::Rsa { .. } => "",
            KeySpec::Ecdsa { curve, .. } => curve,
            KeySpec::Ed25519 => "ED25519",
            KeySpec::Ed448 => "ED448",
        }
    }
}

fn unsupported_curve(algorithm: Algorithm, curve: &str) -> CryptoError {
    CryptoError::UnsupportedCurve {
        algorithm: algorithm.to_string(),
        curve: curve.to_string(),
    }
}

/// Extended key usage placed on CA-signed certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
    Server,
    Client,
}

/// One entry of a certificate revocation list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokedEntry {
    pub serial: u64,
    pub revoked_at: DateTime<Utc>,
}

/// Cryptographic operations consumed by the lifecycle manager.
///
/// Implementations must not retry; every failure is reported as a
/// [`CryptoError`] and ends the current lifecycle operation.
pub trait CryptoProvider {
    fn generate_key_pair(&self, spec: &KeySpec) -> Result<PKey<Private>, CryptoError>;

    fn self_sign(
        &self,
        key: &PKeyRef<Private>,
        subject: &CertificateSubject,
        serial: u64,
        valid_days: u32,
    ) -> Result<X509, CryptoError>;

    fn build_csr(
        &self,
        subject: &CertificateSubject,
        key: &PKeyRef<Private>,
    ) -> Result<X509Req, CryptoError>;

    fn sign_csr(
        &self,
        ca_key: &PKeyRef<Private>,
        ca_cert: &X509Ref,
        csr: &X509ReqRef,
        serial: u64,
        valid_days: u32,
        usage: CertUsage,
    ) -> Result<X509, CryptoError>;

    /// PEM-encoded CRL listing `revoked`, valid for `valid_days`
    fn generate_crl(
        &self,
        ca_key: &PKeyRef<Private>,
        ca_cert: &X509Ref,
        revoked: &[RevokedEntry],
        valid_days: u32,
    ) -> Result<Vec<u8>, CryptoError>;

    /// PEM-encoded DH parameters
    fn generate_dh_params(&self, bits: u32) -> Result<Vec<u8>, CryptoError>;

    fn supported_curves(&self, algorithm: Algorithm) -> Vec<&'static str>;
}

/// [`CryptoProvider`] backed by the system OpenSSL
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensslProvider;

fn fail(context: &'static str) -> impl FnOnce(ErrorStack) -> CryptoError {
    move |e| CryptoError::Library(format!("{}: {}", context, e))
}

fn signing_digest(key: &PKeyRef<Private>) -> MessageDigest {
    match key.id() {
        Id::ED25519 | Id::ED448 => MessageDigest::null(),
        _ => MessageDigest::sha256(),
    }
}

fn serial_to_bignum(serial: u64) -> Result<BigNum, CryptoError> {
    BigNum::from_slice(&serial.to_be_bytes()).map_err(fail("Failed to encode serial"))
}

impl CryptoProvider for OpensslProvider {
    fn generate_key_pair(&self, spec: &KeySpec) -> Result<PKey<Private>, CryptoError> {
        let key = match *spec {
            KeySpec::Rsa { bits } => {
                let rsa = Rsa::generate(bits).map_err(fail("Failed to generate RSA keypair"))?;
                PKey::from_rsa(rsa).map_err(fail("Failed to create private key"))?
            }
            KeySpec::Ecdsa { nid, .. } => {
                let group = EcGroup::from_curve_name(nid).map_err(fail("Failed to load curve"))?;
                let ec = EcKey::generate(&group).map_err(fail("Failed to generate EC keypair"))?;
                PKey::from_ec_key(ec).map_err(fail("Failed to create private key"))?
            }
            KeySpec::Ed25519 => {
                PKey::generate_ed25519().map_err(fail("Failed to generate Ed25519 keypair"))?
            }
            KeySpec::Ed448 => {
                PKey::generate_ed448().map_err(fail("Failed to generate Ed448 keypair"))?
            }
        };
        Ok(key)
    }

    fn self_sign(
        &self,
        key: &PKeyRef<Private>,
        subject: &CertificateSubject,
        serial: u64,
        valid_days: u32,
    ) -> Result<X509, CryptoError> {
        let mut builder = X509::builder().map_err(fail("Failed to create X509 builder"))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(fail("Failed to set version"))?;
        let serial = serial_to_bignum(serial)?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let name = subject.to_x509_name()?;
        builder
            .set_subject_name(&name)
            .map_err(fail("Failed to set subject"))?;
        builder
            .set_issuer_name(&name)
            .map_err(fail("Failed to set issuer"))?;

        let not_before = Asn1Time::days_from_now(0).map_err(fail("Failed to create not_before"))?;
        builder
            .set_not_before(&not_before)
            .map_err(fail("Failed to set not_before"))?;
        let not_after =
            Asn1Time::days_from_now(valid_days).map_err(fail("Failed to create not_after"))?;
        builder
            .set_not_after(&not_after)
            .map_err(fail("Failed to set not_after"))?;
        builder
            .set_pubkey(key)
            .map_err(fail("Failed to set public key"))?;

        let bc = BasicConstraints::new()
            .critical()
            .ca()
            .build()
            .map_err(fail("Failed to build BasicConstraints"))?;
        builder.append_extension(bc)?;

        let ku = KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()
            .map_err(fail("Failed to build KeyUsage"))?;
        builder.append_extension(ku)?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .map_err(fail("Failed to build SubjectKeyIdentifier"))?;
        builder.append_extension(ski)?;

        builder
            .sign(key, signing_digest(key))
            .map_err(fail("Failed to sign certificate"))?;
        Ok(builder.build())
    }

    fn build_csr(
        &self,
        subject: &CertificateSubject,
        key: &PKeyRef<Private>,
    ) -> Result<X509Req, CryptoError> {
        let mut builder = X509ReqBuilder::new().map_err(fail("Failed to create CSR builder"))?;
        builder.set_version(CSR_VERSION_1)?;
        let name = subject.to_x509_name()?;
        builder
            .set_subject_name(&name)
            .map_err(fail("Failed to set CSR subject"))?;
        builder
            .set_pubkey(key)
            .map_err(fail("Failed to set CSR public key"))?;
        builder
            .sign(key, signing_digest(key))
            .map_err(fail("Failed to sign CSR"))?;
        Ok(builder.build())
    }

    fn sign_csr(
        &self,
        ca_key: &PKeyRef<Private>,
        ca_cert: &X509Ref,
        csr: &X509ReqRef,
        serial: u64,
        valid_days: u32,
        usage: CertUsage,
    ) -> Result<X509, CryptoError> {
        let public_key = csr
            .public_key()
            .map_err(fail("Failed to read CSR public key"))?;
        if !csr
            .verify(&public_key)
            .map_err(fail("Failed to verify CSR"))?
        {
            return Err(CryptoError::Library(
                "CSR signature does not match its public key".to_string(),
            ));
        }

        let mut builder = X509::builder().map_err(fail("Failed to create X509 builder"))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(fail("Failed to set version"))?;
        let serial = serial_to_bignum(serial)?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder
            .set_subject_name(csr.subject_name())
            .map_err(fail("Failed to set subject"))?;
        // Issuer is the CA's subject
        builder
            .set_issuer_name(ca_cert.subject_name())
            .map_err(fail("Failed to set issuer from CA"))?;

        let not_before = Asn1Time::days_from_now(0).map_err(fail("Failed to create not_before"))?;
        builder
            .set_not_before(&not_before)
            .map_err(fail("Failed to set not_before"))?;
        let not_after =
            Asn1Time::days_from_now(valid_days).map_err(fail("Failed to create not_after"))?;
        builder
            .set_not_after(&not_after)
            .map_err(fail("Failed to set not_after"))?;
        builder
            .set_pubkey(&public_key)
            .map_err(fail("Failed to set public key"))?;

        let bc = BasicConstraints::new()
            .critical()
            .build()
            .map_err(fail("Failed to build BasicConstraints"))?;
        builder.append_extension(bc)?;

        let mut ku = KeyUsage::new();
        ku.critical().digital_signature();
        if public_key.id() == Id::RSA {
            ku.key_encipherment();
        } else {
            ku.key_agreement();
        }
        let ku = ku.build().map_err(fail("Failed to build KeyUsage"))?;
        builder.append_extension(ku)?;

        let mut eku = ExtendedKeyUsage::new();
        match usage {
            CertUsage::Server => eku.server_auth(),
            CertUsage::Client => eku.client_auth(),
        };
        let eku = eku.build().map_err(fail("Failed to build ExtendedKeyUsage"))?;
        builder.append_extension(eku)?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(ca_cert), None))
            .map_err(fail("Failed to build SubjectKeyIdentifier"))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(true)
            .build(&builder.x509v3_context(Some(ca_cert), None))
            .map_err(fail("Failed to build AuthorityKeyIdentifier"))?;
        builder.append_extension(aki)?;

        builder
            .sign(ca_key, signing_digest(ca_key))
            .map_err(fail("Failed to sign certificate"))?;
        Ok(builder.build())
    }

    fn generate_crl(
        &self,
        ca_key: &PKeyRef<Private>,
        ca_cert: &X509Ref,
        revoked: &[RevokedEntry],
        valid_days: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        let ca_der = ca_cert.to_der().map_err(fail("Failed to encode CA certificate"))?;
        let issuer = x509_cert::Certificate::from_der(&ca_der)?
            .tbs_certificate
            .subject;
        let signature_algorithm = signature_algorithm(ca_key)?;

        let revoked_certificates = revoked
            .iter()
            .map(|entry| {
                Ok(RevokedCert {
                    serial_number: SerialNumber::new(&minimal_be_bytes(entry.serial))?,
                    revocation_date: asn1_time(SystemTime::from(entry.revoked_at))?,
                    crl_entry_extensions: None,
                })
            })
            .collect::<Result<Vec<RevokedCert>, CryptoError>>()?;

        let now = SystemTime::now();
        let next_update = now + Duration::from_secs(u64::from(valid_days) * SECONDS_PER_DAY);
        let tbs_cert_list: TbsCertList = TbsCertList {
            version: x509_cert::Version::V2,
            signature: signature_algorithm.clone(),
            issuer,
            this_update: asn1_time(now)?,
            next_update: Some(asn1_time(next_update)?),
            // An empty sequence must be omitted rather than encoded
            revoked_certificates: if revoked_certificates.is_empty() {
                None
            } else {
                Some(revoked_certificates)
            },
            crl_extensions: None,
        };

        let tbs_der = tbs_cert_list.to_der()?;
        let signature = match ca_key.id() {
            Id::ED25519 | Id::ED448 => {
                let mut signer =
                    Signer::new_without_digest(ca_key).map_err(fail("Failed to create signer"))?;
                signer
                    .sign_oneshot_to_vec(&tbs_der)
                    .map_err(fail("Failed to sign CRL"))?
            }
            _ => {
                let mut signer = Signer::new(MessageDigest::sha256(), ca_key)
                    .map_err(fail("Failed to create signer"))?;
                signer
                    .sign_oneshot_to_vec(&tbs_der)
                    .map_err(fail("Failed to sign CRL"))?
            }
        };

        let crl: CertificateList = CertificateList {
            tbs_cert_list,
            signature_algorithm,
            signature: BitString::from_bytes(&signature)?,
        };
        let crl_der = crl.to_der()?;
        let pem = X509Crl::from_der(&crl_der)
            .map_err(fail("Generated CRL does not parse"))?
            .to_pem()
            .map_err(fail("Failed to encode CRL"))?;
        Ok(pem)
    }

    fn generate_dh_params(&self, bits: u32) -> Result<Vec<u8>, CryptoError> {
        let dh = Dh::generate_params(bits, DH_GENERATOR)
            .map_err(fail("Failed to generate DH parameters"))?;
        dh.params_to_pem()
            .map_err(fail("Failed to encode DH parameters"))
    }

    fn supported_curves(&self, algorithm: Algorithm) -> Vec<&'static str> {
        match algorithm {
            Algorithm::Rsa => Vec::new(),
            Algorithm::Ecdsa => EC_CURVES.iter().map(|(name, _)| *name).collect(),
            Algorithm::Eddsa => ED_CURVES.to_vec(),
        }
    }
}

fn signature_algorithm(key: &PKeyRef<Private>) -> Result<AlgorithmIdentifierOwned, CryptoError> {
    let (oid, parameters) = match key.id() {
        Id::RSA => (OID_SHA256_WITH_RSA, Some(Any::new(Tag::Null, Vec::<u8>::new())?)),
        Id::EC => (OID_ECDSA_WITH_SHA256, None),
        Id::ED25519 => (OID_ED25519, None),
        Id::ED448 => (OID_ED448, None),
        other => {
            return Err(CryptoError::UnsupportedAlgorithm(format!(
                "no CRL signature algorithm for key type {}",
                other.as_raw()
            )))
        }
    };
    Ok(AlgorithmIdentifierOwned { oid, parameters })
}

/// UTCTime until 2049, GeneralizedTime after, as RFC 5280 requires
fn asn1_time(at: SystemTime) -> Result<Time, CryptoError> {
    match UtcTime::from_system_time(at) {
        Ok(time) => Ok(Time::UtcTime(time)),
        Err(_) => Ok(Time::GeneralTime(GeneralizedTime::from_system_time(at)?)),
    }
}

fn minimal_be_bytes(serial: u64) -> Vec<u8> {
    let bytes = serial.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}
