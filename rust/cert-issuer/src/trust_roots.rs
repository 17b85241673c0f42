//! Sources of the root certificates that issued certificates must chain up to

use std::path::PathBuf;

use openssl::x509::X509;
use snafu::{ensure, ResultExt, Snafu};

/// CA bundle that the Kubernetes control plane mounts into every `Pod`
pub const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read trusted roots from {path:?}"))]
    ReadBundle {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse trusted roots from {path:?}"))]
    ParseBundle {
        source: openssl::error::ErrorStack,
        path: PathBuf,
    },

    #[snafu(display("{path:?} does not contain any certificates"))]
    EmptyBundle { path: PathBuf },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Provides the set of trusted root certificates.
///
/// Implementations must not cache, the roots are read again for every validation.
pub trait TrustedRoots: Send + Sync {
    fn read_trusted_roots(&self) -> Result<Vec<X509>>;
}

/// Reads a PEM bundle of root certificates from a file
#[derive(Debug, Clone)]
pub struct FileTrustedRoots {
    path: PathBuf,
}

impl FileTrustedRoots {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TrustedRoots for FileTrustedRoots {
    fn read_trusted_roots(&self) -> Result<Vec<X509>> {
        let path = &self.path;
        let bundle = std::fs::read(path).context(ReadBundleSnafu { path })?;
        let roots = X509::stack_from_pem(&bundle).context(ParseBundleSnafu { path })?;
        ensure!(!roots.is_empty(), EmptyBundleSnafu { path });
        Ok(roots)
    }
}
