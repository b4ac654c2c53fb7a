//! userdir-client - user directory lookup client
//!
//! Looks up one user record by ID, connecting with one of five transport
//! security modes: TLS without verification, TLS against the system trust
//! anchors, TLS against a custom CA bundle, TLS pinned to the server's own
//! certificate file, or no TLS at all.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use userdir_cert::{client_config, ClientSecurityOptions, CredentialSpec};
use userdir_proto::{GetByIdRequest, UserDirectoryClient};

/// How the connection to the server is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// TLS, but do not verify the server certificate
    NoVerify,
    /// TLS verified against the system trust anchors
    SystemRoots,
    /// TLS verified against a custom CA bundle (--ca)
    CustomCa,
    /// TLS trusting the server's own certificate file (--cert)
    PinnedCert,
    /// No transport security
    Insecure,
}

/// UserDir - look up a user record by ID
#[derive(Parser, Debug)]
#[command(name = "userdir-client")]
#[command(about = "User directory lookup client")]
#[command(version)]
struct Cli {
    /// Server host name
    #[arg(long, env = "USERDIR_HOST", default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(long, env = "USERDIR_PORT", default_value_t = 50051)]
    port: u16,

    /// User ID to look up
    #[arg(long, default_value_t = 1)]
    id: u32,

    /// Transport security mode
    #[arg(long, value_enum, default_value = "no-verify")]
    mode: Mode,

    /// CA bundle file (PEM), for --mode custom-ca
    #[arg(long, env = "USERDIR_CA")]
    ca: Option<PathBuf>,

    /// Server certificate file (PEM), for --mode pinned-cert
    #[arg(long, env = "USERDIR_CERT")]
    cert: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "warn" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn security_options(cli: &Cli) -> ClientSecurityOptions {
    ClientSecurityOptions {
        skip_verify: cli.mode == Mode::NoVerify,
        system_roots: cli.mode == Mode::SystemRoots,
        custom_ca: cli.mode == Mode::CustomCa,
        pinned_cert: cli.mode == Mode::PinnedCert,
        ca_path: cli.ca.clone(),
        cert_path: cli.cert.clone(),
    }
}

/// Open a channel over TLS by handing tonic a pre-established TLS stream
/// per connection attempt.
async fn tls_channel(
    host: String,
    port: u16,
    config: Arc<rustls::ClientConfig>,
) -> Result<Channel> {
    let connector = TlsConnector::from(config);

    let channel = Endpoint::from_shared(format!("https://{host}:{port}"))
        .context("invalid server address")?
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let connector = connector.clone();
            let host = host.clone();
            async move {
                let tcp = TcpStream::connect((host.as_str(), port)).await?;
                let name = ServerName::try_from(host.clone()).map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid server name")
                })?;
                let tls = connector.connect(name, tcp).await?;
                Ok::<_, std::io::Error>(TokioIo::new(tls))
            }
        }))
        .await
        .context("could not connect to the server")?;

    Ok(channel)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    userdir_cert::install_crypto_provider();

    if cli.mode == Mode::NoVerify {
        warn!("certificate verification disabled");
    }

    let spec = CredentialSpec::resolve_client(&security_options(&cli))
        .context("invalid security configuration")?;
    let tls = client_config(&spec).context("failed to prepare transport credentials")?;

    let channel = match tls {
        None => {
            debug!("connecting without transport security");
            Endpoint::from_shared(format!("http://{}:{}", cli.host, cli.port))
                .context("invalid server address")?
                .connect()
                .await
                .context("could not connect to the server")?
        }
        Some(config) => tls_channel(cli.host.clone(), cli.port, config).await?,
    };

    let mut client = UserDirectoryClient::new(channel);

    let user = client
        .get_by_id(GetByIdRequest { id: cli.id })
        .await
        .map_err(|status| anyhow::anyhow!("server says: {}", status.message()))?
        .into_inner();

    println!("user found: {} (id {})", user.name, user.id);
    Ok(())
}
