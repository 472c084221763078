//! vpn-pki - local certificate authority and OpenVPN profile generator
//!
//! # Quick Start
//!
//! ```bash
//! # Create the CA, DH parameters and server profile in /srv/vpn
//! vpn-pki init --path /srv/vpn --server vpn.example.com
//!
//! # Issue a client bundle (clients/alice.visz)
//! vpn-pki client --path /srv/vpn --name alice
//!
//! # Revoke it again and refresh the CRL and server profile
//! vpn-pki revoke --path /srv/vpn --name alice
//! ```
//!
//! Set `RUST_LOG=info` to see each lifecycle step.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use vpn_pki::cli::{self, Invocation, Mode};
use vpn_pki::lifecycle::PkiManager;
use vpn_pki::pki_generator::OpensslProvider;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let mut args = std::env::args();
    let exe = args
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_stem())
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    let invocation = match cli::parse_args(args) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("{}", e);
            eprint!("{}", cli::usage(&exe));
            return ExitCode::FAILURE;
        }
    };

    match invocation.mode {
        Mode::Help => {
            print!("{}", cli::usage(&exe));
            return ExitCode::SUCCESS;
        }
        Mode::About => {
            print!("{}", cli::about(&exe));
            return ExitCode::SUCCESS;
        }
        Mode::ShowCurves => {
            print!("{}", cli::curves_listing(&OpensslProvider));
            return ExitCode::SUCCESS;
        }
        Mode::Unknown => {
            eprint!("{}", cli::usage(&exe));
            return ExitCode::FAILURE;
        }
        Mode::Init | Mode::Client | Mode::Revoke => {}
    }

    match run(&invocation) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(invocation: &Invocation) -> Result<()> {
    let path = invocation.path()?;
    match invocation.mode {
        Mode::Init => init(invocation, &path),
        Mode::Client => {
            let mut manager = PkiManager::load(&path).context("Failed to load configuration")?;
            let name = common_name(invocation)?;
            let issued = manager
                .create_client_identity(&name)
                .with_context(|| format!("Failed to create client {:?}", name))?;
            println!("✓ Client certificate issued (serial {})", issued.identity.serial);
            println!("✓ Bundle written to {}", issued.bundle_path.display());
            println!("Successfully created new client");
            Ok(())
        }
        Mode::Revoke => {
            let mut manager = PkiManager::load(&path).context("Failed to load configuration")?;
            let name = common_name(invocation)?;
            let record = manager
                .revoke_client_identity(&name)
                .with_context(|| format!("Failed to revoke client {:?}", name))?;
            println!("✓ Revoked {} (serial {})", record.name, record.serial);
            if manager.config().server.is_some() {
                let profile = manager
                    .export_server()
                    .context("Failed to update server configuration")?;
                println!("✓ Server configuration updated: {}", profile.display());
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn init(invocation: &Invocation, path: &Path) -> Result<()> {
    let options = invocation.init_options()?;
    println!("Using key size {}", options.key_size);
    println!("Certs will be valid for {} days", options.valid_days);

    let (mut manager, resumed) = PkiManager::initialize_or_resume(path, options)
        .context("Failed to initialize certificate authority")?;
    if resumed {
        println!("✓ Resuming setup of the existing certificate authority");
    } else {
        println!("✓ Certificate authority created");
    }

    println!("\nGenerating new server configuration...");
    if resumed && manager.layout().dh_path().is_file() {
        println!("✓ Using existing DH parameters");
    } else if manager
        .create_dh_parameters()
        .context("Failed to generate DH parameters")?
    {
        println!("✓ DH parameters generated");
    }
    let server = manager
        .create_server_identity(false)
        .context("Failed to create server identity")?;
    println!("✓ Server certificate issued (serial {})", server.serial);
    let profile = manager
        .export_server()
        .context("Failed to write server configuration")?;
    println!("✓ Server configuration written to {}", profile.display());
    println!("Successfully initialised config.");
    Ok(())
}

/// `--name`, or prompt for it on stdin
fn common_name(invocation: &Invocation) -> Result<String> {
    if let Some(name) = invocation.name() {
        return Ok(name.to_string());
    }
    print!(
        "Common Name. This should be unique, for example a username [{}]: ",
        cli::DEFAULT_CLIENT_NAME
    );
    io::stdout().flush()?;
    let mut name = String::new();
    io::stdin()
        .read_line(&mut name)
        .context("Failed to read common name")?;
    Ok(cli::client_name_or_default(&name))
}
