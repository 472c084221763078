//! Certificate Subject Module
//!
//! Distinguished-name values used to build certificate signing requests.
//! A subject is fixed once an identity has been issued; the lifecycle
//! manager derives each identity's subject from the configured defaults and
//! only replaces the common name.
//!
//! # Example
//! ```rust
//! use vpn_pki::subject::CertificateSubject;
//!
//! let subject = CertificateSubject::new("vpn.example.com")
//!     .organization("Example Corp")
//!     .organizational_unit("Networks")
//!     .country("AU");
//! assert_eq!(subject.common_name, "vpn.example.com");
//! ```

use openssl::nid::Nid;
use openssl::x509::{X509Name, X509NameBuilder};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// X.509 subject fields. Empty fields are left out of the encoded name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSubject {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub organizational_unit: String,
    pub common_name: String,
    #[serde(default)]
    pub email: String,
}

impl CertificateSubject {
    /// Create a subject carrying only a common name
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Self::default()
        }
    }

    /// Set the country (C), two-letter ISO code
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    /// Set the state/province (ST)
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    /// Set the locality (L)
    pub fn locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = locality.into();
        self
    }

    /// Set the organization (O)
    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization = org.into();
        self
    }

    /// Set the organizational unit (OU)
    pub fn organizational_unit(mut self, ou: impl Into<String>) -> Self {
        self.organizational_unit = ou.into();
        self
    }

    /// Set the email address (emailAddress)
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    /// Copy of this subject with a different common name
    pub fn with_common_name(&self, common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..self.clone()
        }
    }

    /// Encode as an X.509 name in C, ST, L, O, OU, CN, emailAddress order
    pub fn to_x509_name(&self) -> Result<X509Name, CryptoError> {
        let mut name_builder = X509NameBuilder::new()?;
        let entries = [
            (Nid::COUNTRYNAME, &self.country, "country"),
            (Nid::STATEORPROVINCENAME, &self.state, "state/province"),
            (Nid::LOCALITYNAME, &self.locality, "locality"),
            (Nid::ORGANIZATIONNAME, &self.organization, "organization"),
            (
                Nid::ORGANIZATIONALUNITNAME,
                &self.organizational_unit,
                "organizational unit",
            ),
            (Nid::COMMONNAME, &self.common_name, "CN"),
            (Nid::PKCS9_EMAILADDRESS, &self.email, "email"),
        ];
        for (nid, value, label) in entries {
            if value.is_empty() {
                continue;
            }
            name_builder
                .append_entry_by_nid(nid, value)
                .map_err(|e| CryptoError::Library(format!("Failed to set {}: {}", label, e)))?;
        }
        Ok(name_builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_common_name_keeps_other_fields() {
        let base = CertificateSubject::new("vpn.example.com")
            .organization("Example")
            .email("ops@example.com");
        let client = base.with_common_name("alice");

        assert_eq!(client.common_name, "alice");
        assert_eq!(client.organization, "Example");
        assert_eq!(client.email, "ops@example.com");
        assert_eq!(base.common_name, "vpn.example.com");
    }

    #[test]
    fn test_empty_fields_skipped() {
        let name = CertificateSubject::new("alice")
            .country("AU")
            .to_x509_name()
            .unwrap();

        assert_eq!(name.entries().count(), 2);
        let cn = name.entries_by_nid(Nid::COMMONNAME).next().unwrap();
        assert_eq!(cn.data().as_utf8().unwrap().to_string(), "alice");
    }
}
