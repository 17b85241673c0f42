use std::path::PathBuf;

use snafu::{ensure, Snafu};
use stackable_operator::time::Duration;

use crate::trust_roots::SERVICE_ACCOUNT_CA_PATH;

pub const DEFAULT_MANAGED_BY: &str = "cert-issuer";

/// Signer of the `certificates.k8s.io/v1beta1` API, refused by `certificates.k8s.io/v1`
const LEGACY_SIGNER_NAME: &str = "kubernetes.io/legacy-unknown";

/// Maximum time to wait for the signer to issue a certificate.
pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_minutes_unchecked(5);

pub const DEFAULT_PENDING_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(clap::Args, Clone, Debug)]
pub struct IssuerConfig {
    /// Value of the `app.kubernetes.io/managed-by` label on objects created by the issuer
    ///
    /// Existing `CertificateSigningRequest`s are only replaced if they carry this label.
    #[arg(long, env, default_value = DEFAULT_MANAGED_BY)]
    pub managed_by: String,

    /// Signer that `CertificateSigningRequest`s are addressed to, such as `example.com/cluster-ca`
    ///
    /// None of the built-in `kubernetes.io` signers issue certificates that are valid for both
    /// client and server authentication, so this must name a custom signer.
    #[arg(long, env, value_parser = parse_signer_name)]
    pub signer_name: String,

    /// How long to wait for the signer to issue the certificate
    #[arg(long, env, default_value_t = DEFAULT_SIGNING_TIMEOUT)]
    pub signing_timeout: Duration,

    /// How often to report that the certificate is still waiting to be signed
    #[arg(long, env, default_value_t = DEFAULT_PENDING_LOG_INTERVAL)]
    pub pending_log_interval: Duration,

    /// How many leftover `CertificateSigningRequest`s from earlier attempts may be replaced per issuance
    #[arg(long, env, default_value_t = 1)]
    pub max_stale_replacements: usize,

    /// PEM bundle of the roots that issued certificates must chain up to
    #[arg(long, env, default_value = SERVICE_ACCOUNT_CA_PATH)]
    pub trusted_roots: PathBuf,
}

impl IssuerConfig {
    /// Uses the defaults for everything but the signer
    pub fn new(signer_name: impl Into<String>) -> Self {
        Self {
            managed_by: DEFAULT_MANAGED_BY.to_string(),
            signer_name: signer_name.into(),
            signing_timeout: DEFAULT_SIGNING_TIMEOUT,
            pending_log_interval: DEFAULT_PENDING_LOG_INTERVAL,
            max_stale_replacements: 1,
            trusted_roots: PathBuf::from(SERVICE_ACCOUNT_CA_PATH),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum SignerNameError {
    #[snafu(display("signer name {name:?} must have the form <domain>/<path>"))]
    Unqualified { name: String },

    #[snafu(display("signer name {name:?} is not accepted by the certificates.k8s.io/v1 API"))]
    Legacy { name: String },
}

fn parse_signer_name(name: &str) -> Result<String, SignerNameError> {
    let qualified = name
        .split_once('/')
        .is_some_and(|(domain, path)| domain.contains('.') && !path.is_empty());
    ensure!(qualified, UnqualifiedSnafu { name });
    ensure!(name != LEGACY_SIGNER_NAME, LegacySnafu { name });
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[clap(flatten)]
        config: IssuerConfig,
    }

    const SIGNER: &str = "example.com/cluster-ca";

    #[test]
    fn cli_defaults_match_new() {
        let parsed = Cli::parse_from(["cert-issuer", "--signer-name", SIGNER]).config;
        let default = IssuerConfig::new(SIGNER);
        assert_eq!(parsed.managed_by, default.managed_by);
        assert_eq!(parsed.signer_name, default.signer_name);
        assert_eq!(parsed.signing_timeout, default.signing_timeout);
        assert_eq!(parsed.pending_log_interval, default.pending_log_interval);
        assert_eq!(parsed.max_stale_replacements, default.max_stale_replacements);
        assert_eq!(parsed.trusted_roots, default.trusted_roots);
    }

    #[test]
    fn signer_name_is_required() {
        assert!(Cli::try_parse_from(["cert-issuer"]).is_err());
    }

    #[test]
    fn signer_name_must_be_usable_with_v1_api() {
        for rejected in [
            "kubernetes.io/legacy-unknown",
            "cluster-ca",
            "localhost/cluster-ca",
            "example.com/",
        ] {
            assert!(
                Cli::try_parse_from(["cert-issuer", "--signer-name", rejected]).is_err(),
                "{rejected}"
            );
        }
        assert_eq!(parse_signer_name(SIGNER).unwrap(), SIGNER);
        assert!(matches!(
            parse_signer_name("kubernetes.io/legacy-unknown"),
            Err(SignerNameError::Legacy { .. })
        ));
    }

    #[test]
    fn durations_are_human_readable() {
        let parsed = Cli::parse_from([
            "cert-issuer",
            "--signer-name",
            SIGNER,
            "--signing-timeout",
            "2m30s",
            "--pending-log-interval",
            "1s",
        ])
        .config;
        assert_eq!(parsed.signing_timeout.as_secs(), 150);
        assert_eq!(parsed.pending_log_interval.as_secs(), 1);
    }
}
