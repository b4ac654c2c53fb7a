//! userdir-server - user directory gRPC server
//!
//! Looks up user records by ID over gRPC, with the transport secured by
//! one of several mutually-exclusive provisioning strategies: none,
//! static files, automatic domain validation, or a managed certificate
//! authority with renewal before expiry.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use userdir_cert::{
    obtain, CredentialSpec, ObtainOptions, SecurityMode, ServerSecurityOptions,
    TransportCredentials,
};
use userdir_server::{RecordStore, UserDirectoryService};

/// UserDir - user record lookup over gRPC
#[derive(Parser, Debug)]
#[command(name = "userdir-server")]
#[command(about = "User directory gRPC server with pluggable TLS provisioning")]
#[command(version)]
#[command(long_about = r#"
User directory gRPC server with pluggable TLS provisioning.

Exactly one security mode may be selected; with no mode flag the server
runs without transport security.

EXAMPLES:
  # No TLS, dedicated port
  userdir-server --port 50051

  # Static certificate and key from disk
  userdir-server --static-cert --cert service.pem --key service.key

  # Public domain, automatic certificate, shared port 443
  userdir-server --acme --domain test.example.com

  # Managed certificate authority with background renewal
  userdir-server --managed \
    --authority-endpoint https://localhost:8200 \
    --authority-token $USERDIR_AUTHORITY_TOKEN \
    --authority-role my-role \
    --authority-ca ca-org.pem
"#)]
struct Cli {
    /// Host name clients use to reach this server
    #[arg(long, env = "USERDIR_HOST", default_value = "localhost")]
    host: String,

    /// Port to listen on (domain-validated mode always binds 443)
    #[arg(long, env = "USERDIR_PORT", default_value_t = 50051)]
    port: u16,

    /// Serve a static certificate/key pair from disk
    #[arg(long)]
    static_cert: bool,

    /// Certificate chain file (PEM)
    #[arg(long, env = "USERDIR_CERT")]
    cert: Option<PathBuf>,

    /// Private key file (PEM)
    #[arg(long, env = "USERDIR_KEY")]
    key: Option<PathBuf>,

    /// Obtain a certificate automatically by proving domain control
    #[arg(long)]
    acme: bool,

    /// Public domain name for automatic issuance
    #[arg(long, env = "USERDIR_DOMAIN")]
    domain: Option<String>,

    /// Contact email for the issuance account
    #[arg(long, env = "USERDIR_ACME_EMAIL")]
    acme_email: Option<String>,

    /// Use the issuer's staging environment
    #[arg(long)]
    acme_staging: bool,

    /// Obtain certificates from a managed certificate authority
    #[arg(long)]
    managed: bool,

    /// Authority endpoint, e.g. https://localhost:8200
    #[arg(long, env = "USERDIR_AUTHORITY_ENDPOINT")]
    authority_endpoint: Option<String>,

    /// Authority bearer token
    #[arg(long, env = "USERDIR_AUTHORITY_TOKEN")]
    authority_token: Option<String>,

    /// Authority signing role
    #[arg(long, env = "USERDIR_AUTHORITY_ROLE")]
    authority_role: Option<String>,

    /// CA bundle used to trust the authority endpoint (PEM)
    #[arg(long, env = "USERDIR_AUTHORITY_CA")]
    authority_ca: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    userdir_cert::install_crypto_provider();

    let spec = CredentialSpec::resolve_server(&ServerSecurityOptions {
        static_cert: cli.static_cert,
        acme: cli.acme,
        managed: cli.managed,
        cert_path: cli.cert,
        key_path: cli.key,
        domain: cli.domain,
        authority_endpoint: cli.authority_endpoint,
        authority_token: cli.authority_token,
        authority_role: cli.authority_role,
        authority_ca: cli.authority_ca,
    })
    .context("invalid security configuration")?;

    let credentials = obtain(
        &spec,
        &ObtainOptions {
            host: cli.host.clone(),
            acme_contact: cli.acme_email,
            acme_staging: cli.acme_staging,
            acme_cache_dir: None,
        },
    )
    .context("failed to prepare transport credentials")?;

    // Domain validation answers on the well-known HTTPS port.
    let port = if spec.mode() == SecurityMode::DomainValidatedAutomatic {
        443
    } else {
        cli.port
    };
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("invalid listen address")?;

    let store = Arc::new(RecordStore::with_seed_data());
    let service = UserDirectoryService::new(store);

    info!("starting user directory service in {} mode", spec.mode());

    match credentials {
        TransportCredentials::Plaintext => userdir_server::run_plaintext(addr, service)
            .await
            .context("server terminated")?,
        TransportCredentials::Tls(tls) => userdir_server::run_tls(addr, tls, service)
            .await
            .context("server terminated")?,
    }

    info!("user directory service stopped");
    Ok(())
}
