//! Decides whether a previously issued certificate can be reused

use std::sync::Arc;

use openssl::{
    error::ErrorStack,
    pkey::PKey,
    stack::Stack,
    x509::{store::X509StoreBuilder, X509PurposeId, X509StoreContext, X509},
};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::{k8s_openapi::api::core::v1::Secret, kube::runtime::reflector::ObjectRef};
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{info, warn};

use crate::{
    secret_store::{self, SecretStore, SECRET_KEY_CERT, SECRET_KEY_KEY},
    trust_roots::{self, TrustedRoots},
    utils::error_full_message,
};

/// Extended key usages that every issued certificate must be valid for
#[derive(Clone, Copy, Debug, Display, EnumIter, PartialEq, Eq)]
pub enum RequiredUsage {
    #[strum(serialize = "client auth")]
    ClientAuth,
    #[strum(serialize = "server auth")]
    ServerAuth,
}

impl RequiredUsage {
    fn purpose(self) -> X509PurposeId {
        match self {
            RequiredUsage::ClientAuth => X509PurposeId::SSL_CLIENT,
            RequiredUsage::ServerAuth => X509PurposeId::SSL_SERVER,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ValidateError {
    #[snafu(display("failed to parse certificate"))]
    ParseCertificate { source: ErrorStack },

    #[snafu(display("failed to parse private key"))]
    ParsePrivateKey { source: ErrorStack },

    #[snafu(display("failed to read public key of certificate"))]
    ReadPublicKey { source: ErrorStack },

    #[snafu(display("failed to build trust store for {usage}"))]
    BuildTrustStore {
        source: ErrorStack,
        usage: RequiredUsage,
    },

    #[snafu(display("failed to verify certificate for {usage}"))]
    Verify {
        source: ErrorStack,
        usage: RequiredUsage,
    },

    #[snafu(display("certificate is not trusted for {usage}: {reason}"))]
    Untrusted {
        usage: RequiredUsage,
        reason: &'static str,
    },

    #[snafu(display("private key does not belong to the certificate"))]
    KeyMismatch,
}

/// Checks that `cert_pem` chains up to one of `roots` (for all [`RequiredUsage`]s), and that `key_pem` is its private key
pub fn validate(cert_pem: &[u8], key_pem: &[u8], roots: &[X509]) -> Result<(), ValidateError> {
    let cert = X509::from_pem(cert_pem).context(ParseCertificateSnafu)?;
    for usage in RequiredUsage::iter() {
        // The certificate is expected to be signed by a root directly
        let chain = Stack::<X509>::new().context(BuildTrustStoreSnafu { usage })?;
        let store = X509StoreBuilder::new()
            .and_then(|mut store| {
                for root in roots {
                    store.add_cert(root.clone())?;
                }
                store.set_purpose(usage.purpose())?;
                Ok(store.build())
            })
            .context(BuildTrustStoreSnafu { usage })?;
        let verify_error = X509StoreContext::new()
            .and_then(|mut ctx| {
                ctx.init(&store, &cert, &chain, |ctx| {
                    Ok((!ctx.verify_cert()?).then(|| ctx.error()))
                })
            })
            .context(VerifySnafu { usage })?;
        if let Some(verify_error) = verify_error {
            return UntrustedSnafu {
                usage,
                reason: verify_error.error_string(),
            }
            .fail();
        }
    }

    let key = PKey::private_key_from_pem(key_pem).context(ParsePrivateKeySnafu)?;
    let cert_pubkey = cert.public_key().context(ReadPublicKeySnafu)?;
    ensure!(cert_pubkey.public_eq(&key), KeyMismatchSnafu);
    Ok(())
}

/// Why a stored credential cannot be reused
#[derive(Debug, Snafu)]
pub enum UnusableError {
    #[snafu(display("failed to load credential"))]
    LoadSecret { source: secret_store::Error },

    #[snafu(display("{secret} does not exist"))]
    SecretNotFound { secret: ObjectRef<Secret> },

    #[snafu(display("{secret} has no {field:?} field"))]
    MissingField {
        secret: ObjectRef<Secret>,
        field: &'static str,
    },

    #[snafu(display("failed to load trusted roots"))]
    LoadTrustedRoots { source: trust_roots::Error },

    #[snafu(display("{secret} does not hold a valid credential"))]
    Invalid {
        source: ValidateError,
        secret: ObjectRef<Secret>,
    },
}

#[derive(Clone)]
pub struct CertificateValidator {
    roots: Arc<dyn TrustedRoots>,
}

impl CertificateValidator {
    pub fn new(roots: Arc<dyn TrustedRoots>) -> Self {
        Self { roots }
    }

    /// Returns whether the credential stored in `namespace/secret_name` can be reused
    ///
    /// Missing and invalid credentials are treated the same, either way a new certificate must be issued.
    pub async fn is_usable(
        &self,
        secrets: &dyn SecretStore,
        namespace: &str,
        secret_name: &str,
    ) -> bool {
        match self.check(secrets, namespace, secret_name).await {
            Ok(()) => true,
            Err(err @ UnusableError::SecretNotFound { .. }) => {
                info!(error = %err, "No credential stored yet");
                false
            }
            Err(err) => {
                warn!(
                    error = %error_full_message(&err),
                    "Stored credential failed validation"
                );
                false
            }
        }
    }

    async fn check(
        &self,
        secrets: &dyn SecretStore,
        namespace: &str,
        secret_name: &str,
    ) -> Result<(), UnusableError> {
        let secret_ref = || ObjectRef::<Secret>::new(secret_name).within(namespace);
        let secret = secrets
            .get(namespace, secret_name)
            .await
            .context(LoadSecretSnafu)?
            .with_context(|| SecretNotFoundSnafu {
                secret: secret_ref(),
            })?;
        let data = secret.data.unwrap_or_default();
        let field = |field: &'static str| {
            data.get(field)
                .map(|value| value.0.as_slice())
                .with_context(|| MissingFieldSnafu {
                    secret: secret_ref(),
                    field,
                })
        };
        let (cert_pem, key_pem) = (field(SECRET_KEY_CERT)?, field(SECRET_KEY_KEY)?);
        let roots = self
            .roots
            .read_trusted_roots()
            .context(LoadTrustedRootsSnafu)?;
        validate(cert_pem, key_pem, &roots).with_context(|_| InvalidSnafu {
            secret: secret_ref(),
        })
    }
}
