//! Command-line surface: mode and option tokens, usage and about text.
//!
//! ```text
//! vpn-pki <mode> [--option value]...
//! ```
//!
//! The first argument selects the [`Mode`]; every following token must be an
//! option followed by its value.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::configs::{resolve_dns, validate_suffix, InitOptions, NameReusePolicy, Protocol};
use crate::error::{PkiError, Result};
use crate::pki_generator::{Algorithm, CryptoProvider};
use crate::subject::CertificateSubject;

/// Common name used when the client prompt is left blank
pub const DEFAULT_CLIENT_NAME: &str = "client1";

/// What the invocation asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Init,
    Client,
    Revoke,
    ShowCurves,
    Help,
    About,
    Unknown,
}

impl Mode {
    pub fn from_token(token: &str) -> Self {
        match token {
            "init" => Mode::Init,
            "client" => Mode::Client,
            "revoke" => Mode::Revoke,
            "--show-curves" => Mode::ShowCurves,
            "--help" => Mode::Help,
            "--about" => Mode::About,
            _ => Mode::Unknown,
        }
    }
}

/// Recognised `--option` tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKind {
    Name,
    Path,
    KeySize,
    Days,
    Algorithm,
    Curve,
    Suffix,
    Server,
    Port,
    Proto,
    Dns,
    Redirect,
    Dh,
    ReuseNames,
    CommonName,
    Country,
    State,
    Locality,
    Organization,
    OrganizationalUnit,
    Email,
    Unknown,
}

impl OptionKind {
    pub fn from_token(token: &str) -> Self {
        match token {
            "--name" => OptionKind::Name,
            "--path" => OptionKind::Path,
            "--keysize" => OptionKind::KeySize,
            "--days" => OptionKind::Days,
            "--algorithm" => OptionKind::Algorithm,
            "--curve" => OptionKind::Curve,
            "--suffix" => OptionKind::Suffix,
            "--server" => OptionKind::Server,
            "--port" => OptionKind::Port,
            "--proto" => OptionKind::Proto,
            "--dns" => OptionKind::Dns,
            "--redirect" => OptionKind::Redirect,
            "--dh" => OptionKind::Dh,
            "--reuse-names" => OptionKind::ReuseNames,
            "--cn" => OptionKind::CommonName,
            "--country" => OptionKind::Country,
            "--state" => OptionKind::State,
            "--locality" => OptionKind::Locality,
            "--org" => OptionKind::Organization,
            "--ou" => OptionKind::OrganizationalUnit,
            "--email" => OptionKind::Email,
            _ => OptionKind::Unknown,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            OptionKind::Name => "--name",
            OptionKind::Path => "--path",
            OptionKind::KeySize => "--keysize",
            OptionKind::Days => "--days",
            OptionKind::Algorithm => "--algorithm",
            OptionKind::Curve => "--curve",
            OptionKind::Suffix => "--suffix",
            OptionKind::Server => "--server",
            OptionKind::Port => "--port",
            OptionKind::Proto => "--proto",
            OptionKind::Dns => "--dns",
            OptionKind::Redirect => "--redirect",
            OptionKind::Dh => "--dh",
            OptionKind::ReuseNames => "--reuse-names",
            OptionKind::CommonName => "--cn",
            OptionKind::Country => "--country",
            OptionKind::State => "--state",
            OptionKind::Locality => "--locality",
            OptionKind::Organization => "--org",
            OptionKind::OrganizationalUnit => "--ou",
            OptionKind::Email => "--email",
            OptionKind::Unknown => "unknown",
        }
    }
}

/// Token-level errors; the caller prints usage and exits non-zero
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("no mode given")]
    MissingMode,

    #[error("unknown mode {0:?}")]
    UnknownMode(String),

    #[error("unknown option {0:?}")]
    UnknownOption(String),

    #[error("option {0} missing argument")]
    MissingValue(String),
}

/// A parsed command line
#[derive(Debug, Clone)]
pub struct Invocation {
    pub mode: Mode,
    options: HashMap<OptionKind, String>,
}

/// Parse the arguments after the program name
pub fn parse_args<I>(args: I) -> std::result::Result<Invocation, UsageError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mode_token = args.next().ok_or(UsageError::MissingMode)?;
    let mode = Mode::from_token(&mode_token);
    if mode == Mode::Unknown {
        return Err(UsageError::UnknownMode(mode_token));
    }

    let mut options = HashMap::new();
    while let Some(token) = args.next() {
        let kind = OptionKind::from_token(&token);
        if kind == OptionKind::Unknown {
            return Err(UsageError::UnknownOption(token));
        }
        let value = args.next().ok_or(UsageError::MissingValue(token))?;
        // Last occurrence wins
        options.insert(kind, value);
    }
    Ok(Invocation { mode, options })
}

fn parse_number<T: std::str::FromStr>(kind: OptionKind, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        PkiError::InvalidInput(format!("{} does not have a valid value", kind.token()))
    })
}

/// A typed common name, or [`DEFAULT_CLIENT_NAME`] when blank
pub fn client_name_or_default(input: &str) -> String {
    match input.trim() {
        "" => DEFAULT_CLIENT_NAME.to_string(),
        name => name.to_string(),
    }
}

/// Subject field value; a lone `.` leaves the field blank
fn subject_field(value: &str) -> String {
    match value.trim() {
        "." => String::new(),
        field => field.to_string(),
    }
}

fn parse_yes_no(kind: OptionKind, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" => Ok(true),
        "no" | "n" | "false" => Ok(false),
        _ => Err(PkiError::InvalidInput(format!(
            "{} expects yes or no, got {:?}",
            kind.token(),
            value
        ))),
    }
}

impl Invocation {
    pub fn value(&self, kind: OptionKind) -> Option<&str> {
        self.options.get(&kind).map(String::as_str)
    }

    /// Common name given with `--name`
    pub fn name(&self) -> Option<&str> {
        self.value(OptionKind::Name)
    }

    /// `--path`, or the current directory. The directory must already exist.
    pub fn path(&self) -> Result<PathBuf> {
        let path = match self.value(OptionKind::Path) {
            Some(path) => PathBuf::from(path),
            None => std::env::current_dir().map_err(|e| PkiError::Path {
                path: PathBuf::from("."),
                reason: e.to_string(),
            })?,
        };
        if !path.is_dir() {
            return Err(PkiError::Path {
                path,
                reason: "not found".to_string(),
            });
        }
        Ok(path)
    }

    /// Initial settings for `init`, starting from [`InitOptions::default`]
    pub fn init_options(&self) -> Result<InitOptions> {
        let mut options = InitOptions::default();
        if let Some(value) = self.value(OptionKind::KeySize) {
            options.key_size = parse_number(OptionKind::KeySize, value)?;
        }
        if let Some(value) = self.value(OptionKind::Days) {
            options.valid_days = parse_number(OptionKind::Days, value)?;
        }
        if let Some(value) = self.value(OptionKind::Algorithm) {
            options.algorithm = value
                .parse::<Algorithm>()
                .map_err(|e| PkiError::InvalidInput(e.to_string()))?;
        }
        if let Some(value) = self.value(OptionKind::Curve) {
            options.curve = value.to_string();
        }
        if let Some(value) = self.value(OptionKind::Suffix) {
            options.suffix = value.to_string();
        }
        if let Some(value) = self.value(OptionKind::Server) {
            if value.trim().is_empty() {
                return Err(PkiError::InvalidInput(
                    "--server must not be empty".to_string(),
                ));
            }
            options.network.address = value.trim().to_string();
        }
        if let Some(value) = self.value(OptionKind::Port) {
            let port: u16 = parse_number(OptionKind::Port, value)?;
            if !(1..=65534).contains(&port) {
                return Err(PkiError::InvalidInput(format!(
                    "--port must be between 1 and 65534, got {}",
                    port
                )));
            }
            options.network.port = port;
        }
        if let Some(value) = self.value(OptionKind::Proto) {
            options.network.protocol = value.parse::<Protocol>()?;
        }
        if let Some(value) = self.value(OptionKind::Dns) {
            options.network.dns = resolve_dns(value)?;
        }
        if let Some(value) = self.value(OptionKind::Redirect) {
            options.network.redirect_gateway = parse_yes_no(OptionKind::Redirect, value)?;
        }
        if let Some(value) = self.value(OptionKind::Dh) {
            options.dh_parameters = parse_yes_no(OptionKind::Dh, value)?;
        }
        if let Some(value) = self.value(OptionKind::Suffix) {
            validate_suffix(value)?;
        }
        options.subject = self.subject(&options.network.address);
        if let Some(value) = self.value(OptionKind::ReuseNames) {
            options.name_reuse = if parse_yes_no(OptionKind::ReuseNames, value)? {
                NameReusePolicy::ReleaseOnRevoke
            } else {
                NameReusePolicy::Reserved
            };
        }
        Ok(options)
    }
}

impl Invocation {
    /// CA subject from the subject options, or `None` when none was given.
    /// The common name defaults to the server address.
    fn subject(&self, address: &str) -> Option<CertificateSubject> {
        const FIELDS: [OptionKind; 7] = [
            OptionKind::CommonName,
            OptionKind::Country,
            OptionKind::State,
            OptionKind::Locality,
            OptionKind::Organization,
            OptionKind::OrganizationalUnit,
            OptionKind::Email,
        ];
        if !FIELDS.iter().any(|kind| self.options.contains_key(kind)) {
            return None;
        }
        let field = |kind| self.value(kind).map(subject_field).unwrap_or_default();
        let common_name = match self.value(OptionKind::CommonName).map(str::trim) {
            Some(cn) if !cn.is_empty() && cn != "." => cn.to_string(),
            _ => address.to_string(),
        };
        Some(
            CertificateSubject::new(common_name)
                .country(field(OptionKind::Country))
                .state(field(OptionKind::State))
                .locality(field(OptionKind::Locality))
                .organization(field(OptionKind::Organization))
                .organizational_unit(field(OptionKind::OrganizationalUnit))
                .email(field(OptionKind::Email)),
        )
    }
}

pub fn usage(exe: &str) -> String {
    format!(
        "\
Usage: {exe} init
Initialise configuration, creates server configuration
Optional:
  --path DIR        Directory configurations are stored (Current Directory default)
  --keysize SIZE    Change Keysize (2048 default)
  --days DAYS       Days certificates are valid (3650 default)
  --algorithm (rsa|ecdsa|eddsa)  Algorithm to use (RSA default)
                    ECDSA defaults to secp384r1. EDDSA defaults to ED25519
  --curve NAME      ECDSA/EDDSA curve to use
  --suffix SUFFIX   Appends suffix to server file names
  --server ADDR     Address clients connect to (localhost default)
  --port PORT       Server port (1194 default)
  --proto (udp|tcp) Server protocol (udp default)
  --dns (cloudflare|google|opendns|local|none|IP[,IP...])  DNS servers pushed to clients
  --redirect (yes|no)     Redirect all client traffic through the VPN (yes default)
  --dh (yes|no)           Generate DH parameters (yes default)
  --reuse-names (yes|no)  Allow a revoked client name to be issued again (no default)
  --cn NAME         CA common name (server address default)
  --country CODE    Country Name, 2 letter ISO code
  --state NAME      State or Province
  --locality NAME   Locality Name, e.g. a City
  --org NAME        Organisation Name
  --ou NAME         Organisation Unit, e.g. department
  --email ADDR      Email Address
                    Subject values of '.' are left blank

Usage: {exe} client
Creates client configurations
Optional:
  --path DIR        Directory configurations are stored (Current Directory default)
  --name NAME       Prefill Common Name ({DEFAULT_CLIENT_NAME} if left blank)

Usage: {exe} revoke
Revoke a client and create/update the CRL
Optional:
  --path DIR        Directory configurations are stored (Current Directory default)
  --name NAME       Prefill Common Name ({DEFAULT_CLIENT_NAME} if left blank)

Usage: {exe} --show-curves
Show available ECDSA/EdDSA curves

Usage: {exe} --help
Displays this information

Usage: {exe} --about
Displays information about this tool
"
    )
}

pub fn about(exe: &str) -> String {
    format!(
        "{} {}\nUsing {}\n",
        exe,
        env!("CARGO_PKG_VERSION"),
        openssl::version::version()
    )
}

/// Curve listing for `--show-curves`
pub fn curves_listing(provider: &impl CryptoProvider) -> String {
    let mut out = String::from("EdDSA Curves:\n");
    for curve in provider.supported_curves(Algorithm::Eddsa) {
        out.push_str(&format!("\t{}\n", curve));
    }
    out.push_str("NOTE: EdDSA support requires OpenVPN 2.4.7+ and OpenSSL 1.1.1+.\n\n");
    out.push_str("ECDSA Curves:\n");
    for curve in provider.supported_curves(Algorithm::Ecdsa) {
        out.push_str(&format!("\t{}\n", curve));
    }
    out.push_str("NOTE: Not all curves may be supported.\n");
    out.push_str("Check 'openvpn --show-curves' on your server.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki_generator::OpensslProvider;

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mode_tokens() {
        assert_eq!(Mode::from_token("init"), Mode::Init);
        assert_eq!(Mode::from_token("--show-curves"), Mode::ShowCurves);
        assert_eq!(Mode::from_token("INIT"), Mode::Unknown);
        assert_eq!(OptionKind::from_token("--reuse-names"), OptionKind::ReuseNames);
        assert_eq!(OptionKind::from_token("--verbose"), OptionKind::Unknown);
    }

    #[test]
    fn test_parse_args_errors() {
        assert_eq!(parse_args(args(&[])).unwrap_err(), UsageError::MissingMode);
        assert_eq!(
            parse_args(args(&["create"])).unwrap_err(),
            UsageError::UnknownMode("create".to_string())
        );
        assert_eq!(
            parse_args(args(&["client", "--colour", "red"])).unwrap_err(),
            UsageError::UnknownOption("--colour".to_string())
        );
        assert_eq!(
            parse_args(args(&["client", "--name"])).unwrap_err(),
            UsageError::MissingValue("--name".to_string())
        );
    }

    #[test]
    fn test_init_options_from_args() {
        let invocation = parse_args(args(&[
            "init",
            "--keysize",
            "4096",
            "--algorithm",
            "ecdsa",
            "--curve",
            "prime256v1",
            "--server",
            "vpn.example.com",
            "--proto",
            "tcp",
            "--dns",
            "google",
            "--dh",
            "no",
            "--reuse-names",
            "yes",
        ]))
        .unwrap();
        assert_eq!(invocation.mode, Mode::Init);

        let options = invocation.init_options().unwrap();
        assert_eq!(options.key_size, 4096);
        assert_eq!(options.valid_days, 3650);
        assert_eq!(options.algorithm, Algorithm::Ecdsa);
        assert_eq!(options.curve, "prime256v1");
        assert_eq!(options.network.address, "vpn.example.com");
        assert_eq!(options.network.protocol, Protocol::Tcp);
        assert_eq!(options.network.dns, vec!["8.8.8.8", "8.8.4.4"]);
        assert!(!options.dh_parameters);
        assert_eq!(options.name_reuse, NameReusePolicy::ReleaseOnRevoke);
    }

    #[test]
    fn test_invalid_values_are_input_errors() {
        for tokens in [
            &["init", "--algorithm", "dsa"][..],
            &["init", "--keysize", "big"][..],
            &["init", "--redirect", "maybe"][..],
            &["init", "--port", "70000"][..],
        ] {
            let invocation = parse_args(args(tokens)).unwrap();
            assert!(
                matches!(invocation.init_options(), Err(PkiError::InvalidInput(_))),
                "{:?} should be rejected",
                tokens
            );
        }
    }

    #[test]
    fn test_port_range() {
        for port in ["0", "65535"] {
            let invocation = parse_args(args(&["init", "--port", port])).unwrap();
            assert!(
                matches!(invocation.init_options(), Err(PkiError::InvalidInput(_))),
                "port {} should be rejected",
                port
            );
        }
        for port in ["1", "65534"] {
            let invocation = parse_args(args(&["init", "--port", port])).unwrap();
            assert_eq!(
                invocation.init_options().unwrap().network.port.to_string(),
                port
            );
        }
    }

    #[test]
    fn test_suffix_with_separator_rejected() {
        let invocation = parse_args(args(&["init", "--suffix", "a/b"])).unwrap();
        assert!(matches!(
            invocation.init_options(),
            Err(PkiError::InvalidInput(_))
        ));

        let invocation = parse_args(args(&["init", "--suffix", "-eu"])).unwrap();
        assert_eq!(invocation.init_options().unwrap().suffix, "-eu");
    }

    #[test]
    fn test_subject_options() {
        let invocation = parse_args(args(&[
            "init",
            "--server",
            "vpn.example.com",
            "--country",
            "NL",
            "--state",
            ".",
            "--org",
            "Example Org",
            "--email",
            "ops@example.com",
        ]))
        .unwrap();
        let subject = invocation.init_options().unwrap().subject.unwrap();
        assert_eq!(subject.common_name, "vpn.example.com");
        assert_eq!(subject.country, "NL");
        assert_eq!(subject.state, "");
        assert_eq!(subject.locality, "");
        assert_eq!(subject.organization, "Example Org");
        assert_eq!(subject.email, "ops@example.com");

        let invocation = parse_args(args(&["init", "--cn", "Lab CA", "--ou", "."])).unwrap();
        let subject = invocation.init_options().unwrap().subject.unwrap();
        assert_eq!(subject.common_name, "Lab CA");
        assert_eq!(subject.organizational_unit, "");

        let invocation = parse_args(args(&["init", "--server", "vpn.example.com"])).unwrap();
        assert!(invocation.init_options().unwrap().subject.is_none());
    }

    #[test]
    fn test_blank_client_name_defaults() {
        assert_eq!(client_name_or_default(""), DEFAULT_CLIENT_NAME);
        assert_eq!(client_name_or_default("  \n"), "client1");
        assert_eq!(client_name_or_default(" bob \n"), "bob");
    }

    #[test]
    fn test_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let invocation = parse_args(args(&[
            "client",
            "--path",
            missing.to_str().unwrap(),
        ]))
        .unwrap();
        assert!(matches!(invocation.path(), Err(PkiError::Path { .. })));

        let invocation = parse_args(args(&[
            "client",
            "--path",
            dir.path().to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(invocation.path().unwrap(), dir.path());
    }

    #[test]
    fn test_usage_and_curves_text() {
        let text = usage("vpn-pki");
        assert!(text.contains("Usage: vpn-pki revoke"));
        assert!(text.contains("--show-curves"));
        assert!(text.contains("--country"));
        assert!(text.contains("--org"));

        let curves = curves_listing(&OpensslProvider);
        assert!(curves.contains("\tED25519\n"));
        assert!(curves.contains("\tsecp384r1\n"));
    }
}
