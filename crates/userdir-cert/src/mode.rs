//! Security mode selection and validation
//!
//! Turns the raw flag/environment inputs of a binary into an immutable
//! [`CredentialSpec`]. Selecting more than one mode at once is a hard
//! configuration error; nothing here guesses a precedence winner.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Configuration errors. Fatal at startup: the caller reports them and
/// exits non-zero. The resolver itself never terminates the process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("conflicting security modes selected: {0} and {1}")]
    ConflictingModes(&'static str, &'static str),

    #[error("{mode} requires {field}")]
    MissingField {
        mode: &'static str,
        field: &'static str,
    },

    #[error("{field} is not used by {mode}")]
    UnexpectedField {
        mode: &'static str,
        field: &'static str,
    },
}

/// How the transport is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// No transport security at all.
    Insecure,
    /// Client: TLS without verifying the peer certificate.
    SelfSignedSkipVerify,
    /// Client: TLS verified against the system trust anchors.
    SelfSignedVerify,
    /// Client: TLS verified against a caller-supplied CA bundle.
    VerifyWithCustomCa,
    /// Server: serve a certificate/key pair from disk.
    /// Client: trust one specific certificate file.
    StaticCertFile,
    /// Server: obtain a certificate automatically by proving control of a
    /// public domain name.
    DomainValidatedAutomatic,
    /// Server: obtain certificates from a managed certificate authority,
    /// reissuing before expiry.
    AuthorityIssuedManaged,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Insecure => "insecure",
            SecurityMode::SelfSignedSkipVerify => "TLS without verification",
            SecurityMode::SelfSignedVerify => "TLS with system trust anchors",
            SecurityMode::VerifyWithCustomCa => "TLS with a custom CA bundle",
            SecurityMode::StaticCertFile => "static certificate file",
            SecurityMode::DomainValidatedAutomatic => "automatic domain validation",
            SecurityMode::AuthorityIssuedManaged => "managed certificate authority",
        }
    }
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw server-side security inputs, as collected from flags/environment.
/// The selection booleans are intentionally not mutually exclusive here;
/// [`CredentialSpec::resolve_server`] enforces that.
#[derive(Debug, Clone, Default)]
pub struct ServerSecurityOptions {
    pub static_cert: bool,
    pub acme: bool,
    pub managed: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub domain: Option<String>,
    pub authority_endpoint: Option<String>,
    pub authority_token: Option<String>,
    pub authority_role: Option<String>,
    pub authority_ca: Option<PathBuf>,
}

/// Raw client-side security inputs.
#[derive(Debug, Clone, Default)]
pub struct ClientSecurityOptions {
    pub skip_verify: bool,
    pub system_roots: bool,
    pub custom_ca: bool,
    pub pinned_cert: bool,
    pub ca_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
}

/// A validated description of the active security mode and its inputs.
///
/// Immutable once constructed: exactly the fields the mode requires are
/// populated, everything else is `None`.
#[derive(Debug, Clone)]
pub struct CredentialSpec {
    mode: SecurityMode,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    ca_path: Option<PathBuf>,
    domain: Option<String>,
    authority_endpoint: Option<String>,
    authority_token: Option<String>,
    authority_role: Option<String>,
}

impl CredentialSpec {
    /// Validate server-side inputs into a credential spec.
    pub fn resolve_server(opts: &ServerSecurityOptions) -> Result<Self, ConfigError> {
        let selected = selection(&[
            ("--static-cert", opts.static_cert),
            ("--acme", opts.acme),
            ("--managed", opts.managed),
        ])?;

        match selected {
            None => {
                let spec = Self::empty(SecurityMode::Insecure);
                forbid("insecure", "--cert", &opts.cert_path)?;
                forbid("insecure", "--key", &opts.key_path)?;
                forbid("insecure", "--domain", &opts.domain)?;
                spec.forbid_authority("insecure", opts)?;
                Ok(spec)
            }
            Some("--static-cert") => {
                let mode = "static certificate mode";
                let mut spec = Self::empty(SecurityMode::StaticCertFile);
                spec.cert_path = Some(require(mode, "--cert", &opts.cert_path)?);
                spec.key_path = Some(require(mode, "--key", &opts.key_path)?);
                forbid(mode, "--domain", &opts.domain)?;
                spec.forbid_authority(mode, opts)?;
                Ok(spec)
            }
            Some("--acme") => {
                let mode = "automatic domain validation mode";
                let mut spec = Self::empty(SecurityMode::DomainValidatedAutomatic);
                spec.domain = Some(require(mode, "--domain", &opts.domain)?);
                forbid(mode, "--cert", &opts.cert_path)?;
                forbid(mode, "--key", &opts.key_path)?;
                spec.forbid_authority(mode, opts)?;
                Ok(spec)
            }
            Some("--managed") => {
                let mode = "managed authority mode";
                let mut spec = Self::empty(SecurityMode::AuthorityIssuedManaged);
                spec.authority_endpoint =
                    Some(require(mode, "--authority-endpoint", &opts.authority_endpoint)?);
                spec.authority_token =
                    Some(require(mode, "--authority-token", &opts.authority_token)?);
                spec.authority_role =
                    Some(require(mode, "--authority-role", &opts.authority_role)?);
                spec.ca_path = Some(require(mode, "--authority-ca", &opts.authority_ca)?);
                forbid(mode, "--cert", &opts.cert_path)?;
                forbid(mode, "--key", &opts.key_path)?;
                forbid(mode, "--domain", &opts.domain)?;
                Ok(spec)
            }
            Some(_) => unreachable!("selection returns only known flags"),
        }
    }

    /// Validate client-side inputs into a credential spec.
    pub fn resolve_client(opts: &ClientSecurityOptions) -> Result<Self, ConfigError> {
        let selected = selection(&[
            ("no-verify", opts.skip_verify),
            ("system-roots", opts.system_roots),
            ("custom-ca", opts.custom_ca),
            ("pinned-cert", opts.pinned_cert),
        ])?;

        match selected {
            None => {
                let spec = Self::empty(SecurityMode::Insecure);
                forbid("insecure", "--ca", &opts.ca_path)?;
                forbid("insecure", "--cert", &opts.cert_path)?;
                Ok(spec)
            }
            Some("no-verify") => {
                let mode = "no-verify mode";
                forbid(mode, "--ca", &opts.ca_path)?;
                forbid(mode, "--cert", &opts.cert_path)?;
                Ok(Self::empty(SecurityMode::SelfSignedSkipVerify))
            }
            Some("system-roots") => {
                let mode = "system-roots mode";
                forbid(mode, "--ca", &opts.ca_path)?;
                forbid(mode, "--cert", &opts.cert_path)?;
                Ok(Self::empty(SecurityMode::SelfSignedVerify))
            }
            Some("custom-ca") => {
                let mode = "custom-ca mode";
                let mut spec = Self::empty(SecurityMode::VerifyWithCustomCa);
                spec.ca_path = Some(require(mode, "--ca", &opts.ca_path)?);
                forbid(mode, "--cert", &opts.cert_path)?;
                Ok(spec)
            }
            Some("pinned-cert") => {
                let mode = "pinned-cert mode";
                let mut spec = Self::empty(SecurityMode::StaticCertFile);
                spec.cert_path = Some(require(mode, "--cert", &opts.cert_path)?);
                forbid(mode, "--ca", &opts.ca_path)?;
                Ok(spec)
            }
            Some(_) => unreachable!("selection returns only known flags"),
        }
    }

    fn empty(mode: SecurityMode) -> Self {
        Self {
            mode,
            cert_path: None,
            key_path: None,
            ca_path: None,
            domain: None,
            authority_endpoint: None,
            authority_token: None,
            authority_role: None,
        }
    }

    fn forbid_authority(
        &self,
        mode: &'static str,
        opts: &ServerSecurityOptions,
    ) -> Result<(), ConfigError> {
        forbid(mode, "--authority-endpoint", &opts.authority_endpoint)?;
        forbid(mode, "--authority-token", &opts.authority_token)?;
        forbid(mode, "--authority-role", &opts.authority_role)?;
        forbid(mode, "--authority-ca", &opts.authority_ca)?;
        Ok(())
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn cert_path(&self) -> Option<&Path> {
        self.cert_path.as_deref()
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    pub fn ca_path(&self) -> Option<&Path> {
        self.ca_path.as_deref()
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn authority_endpoint(&self) -> Option<&str> {
        self.authority_endpoint.as_deref()
    }

    pub fn authority_token(&self) -> Option<&str> {
        self.authority_token.as_deref()
    }

    pub fn authority_role(&self) -> Option<&str> {
        self.authority_role.as_deref()
    }
}

/// At most one selection flag may be set. Returns the selected flag name,
/// or the first conflicting pair.
fn selection(flags: &[(&'static str, bool)]) -> Result<Option<&'static str>, ConfigError> {
    let mut chosen = None;
    for &(name, set) in flags {
        if !set {
            continue;
        }
        match chosen {
            None => chosen = Some(name),
            Some(first) => return Err(ConfigError::ConflictingModes(first, name)),
        }
    }
    Ok(chosen)
}

fn require<T: Clone>(
    mode: &'static str,
    field: &'static str,
    value: &Option<T>,
) -> Result<T, ConfigError> {
    value
        .clone()
        .ok_or(ConfigError::MissingField { mode, field })
}

fn forbid<T>(mode: &'static str, field: &'static str, value: &Option<T>) -> Result<(), ConfigError> {
    match value {
        Some(_) => Err(ConfigError::UnexpectedField { mode, field }),
        None => Ok(()),
    }
}
