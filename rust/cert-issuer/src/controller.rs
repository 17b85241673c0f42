//! Drives a certificate from key generation, through the cluster's signer, into a credential [`Secret`]

use std::{collections::BTreeMap, sync::Arc};

use futures::StreamExt;
use openssl::{hash::MessageDigest, x509::X509};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            certificates::v1::{
                CertificateSigningRequest, CertificateSigningRequestCondition,
                CertificateSigningRequestSpec,
            },
            core::v1::Secret,
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
        ByteString,
    },
    kube::{api::WatchEvent, runtime::reflector::ObjectRef},
};
use strum::{EnumDiscriminants, IntoEnumIterator, IntoStaticStr};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::{
    config::IssuerConfig,
    identity::Identity,
    key_material::{self, generate_csr, request_to_pem},
    labels::Ownership,
    secret_store::{self, SecretStore, SECRET_KEY_CERT, SECRET_KEY_KEY},
    signing_authority::{self, csr_ref, SigningAuthority},
    trust_roots::TrustedRoots,
    utils::{FmtByteSlice, Unloggable},
    validator::{CertificateValidator, RequiredUsage},
};

pub const CONDITION_APPROVED: &str = "Approved";
const APPROVAL_REASON: &str = "AutoApproved";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to generate key material for {csr}"))]
    GenerateKeyMaterial {
        source: key_material::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("failed to look up existing signing request"))]
    GetSigningRequest { source: signing_authority::Error },

    #[snafu(display("{csr} already exists, but is not managed by {managed_by:?}, refusing to replace it"))]
    ForeignSigningRequest {
        csr: ObjectRef<CertificateSigningRequest>,
        managed_by: String,
    },

    #[snafu(display("{csr} still exists after replacing it {replacements} time(s)"))]
    StaleSigningRequest {
        csr: ObjectRef<CertificateSigningRequest>,
        replacements: usize,
    },

    #[snafu(display("failed to delete stale signing request"))]
    DeleteStaleSigningRequest { source: signing_authority::Error },

    #[snafu(display("failed to create signing request"))]
    CreateSigningRequest { source: signing_authority::Error },

    #[snafu(display("failed to approve signing request"))]
    ApproveSigningRequest { source: signing_authority::Error },

    #[snafu(display("failed to watch signing request"))]
    WatchSigningRequest { source: signing_authority::Error },

    #[snafu(display("timed out waiting for {csr} to be signed"))]
    SigningTimeout {
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("failed to save signed certificate"))]
    SaveSecret { source: secret_store::Error },

    #[snafu(display("failed to clean up consumed signing request"))]
    DeleteSigningRequest { source: signing_authority::Error },

    #[snafu(display("failed to load credential"))]
    LoadSecret { source: secret_store::Error },

    #[snafu(display("{secret} does not exist"))]
    SecretNotFound { secret: ObjectRef<Secret> },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Short, stable name of the failure, suitable for grouping log messages
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// Issues certificates by sending signing requests to the cluster's signer, and approving them ourselves
pub struct CsrController {
    secrets: Arc<dyn SecretStore>,
    authority: Arc<dyn SigningAuthority>,
    validator: CertificateValidator,
    config: IssuerConfig,
}

impl CsrController {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        authority: Arc<dyn SigningAuthority>,
        roots: Arc<dyn TrustedRoots>,
        config: IssuerConfig,
    ) -> Self {
        Self {
            secrets,
            authority,
            validator: CertificateValidator::new(roots),
            config,
        }
    }

    fn ownership<'a>(&'a self, identity: &'a Identity) -> Ownership<'a> {
        Ownership {
            namespace: &identity.namespace,
            managed_by: &self.config.managed_by,
            instance: &identity.instance,
        }
    }

    /// Makes sure that a usable certificate for `identity` is stored in its credential [`Secret`]
    ///
    /// This is a no-op if a valid certificate already exists. Otherwise, a fresh key pair is generated
    /// and a new certificate is requested, regardless of what was stored before.
    #[tracing::instrument(skip(self, identity), fields(namespace = %identity.namespace, instance = %identity.instance))]
    pub async fn ensure_certificate(&self, identity: &Identity) -> Result<()> {
        let name = identity.resource_name();
        let csr_ref = csr_ref(&name);

        if self.check_secret(&identity.namespace, &name).await {
            info!(secret = %name, "Credential already exists and is valid, reusing it");
            return Ok(());
        }

        let generated = generate_csr(
            &identity.common_name,
            &identity.dns_names,
            &identity.ip_addresses,
        )
        .with_context(|_| GenerateKeyMaterialSnafu {
            csr: csr_ref.clone(),
        })?;
        let request_pem = request_to_pem(&generated.request_der).with_context(|_| {
            GenerateKeyMaterialSnafu {
                csr: csr_ref.clone(),
            }
        })?;

        let created = self.send_csr(identity, &name, request_pem).await?;
        let approved = self.approve_csr(&created).await?;
        let certificate = self.wait_for_certificate(&approved).await?;
        info!(csr = %csr_ref, "Certificate has been signed");

        self.save_to_secret(identity, certificate, generated.key_pem)
            .await?;
        // The request is kept if saving failed, since it is the only remaining copy of the certificate
        self.authority
            .delete(&name)
            .await
            .context(DeleteSigningRequestSnafu)
    }

    /// Returns whether a usable credential is stored in `namespace/secret_name`
    pub async fn check_secret(&self, namespace: &str, secret_name: &str) -> bool {
        self.validator
            .is_usable(self.secrets.as_ref(), namespace, secret_name)
            .await
    }

    /// Loads the certificate and private key stored in `namespace/secret_name`
    ///
    /// Missing fields are returned as empty.
    pub async fn load_from_secret(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<(Vec<u8>, Unloggable<Vec<u8>>)> {
        let secret = self
            .secrets
            .get(namespace, secret_name)
            .await
            .context(LoadSecretSnafu)?
            .with_context(|| SecretNotFoundSnafu {
                secret: ObjectRef::new(secret_name).within(namespace),
            })?;
        let mut data = secret.data.unwrap_or_default();
        let mut take = |field: &str| data.remove(field).map(|value| value.0).unwrap_or_default();
        let cert = take(SECRET_KEY_CERT);
        let key = take(SECRET_KEY_KEY);
        Ok((cert, Unloggable(key)))
    }

    /// Stores a certificate and its private key in the credential [`Secret`] of `identity`
    pub async fn save_to_secret(
        &self,
        identity: &Identity,
        cert: Vec<u8>,
        key: Unloggable<Vec<u8>>,
    ) -> Result<()> {
        let name = identity.resource_name();
        let fingerprint = X509::from_pem(&cert).and_then(|cert| cert.digest(MessageDigest::sha256()));
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(identity.namespace.clone()),
                labels: Some(
                    self.ownership(identity)
                        .labels_with_component(&identity.component),
                ),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([
                (SECRET_KEY_CERT.to_string(), ByteString(cert)),
                (SECRET_KEY_KEY.to_string(), ByteString(key.0)),
            ])),
            ..Secret::default()
        };
        self.secrets
            .create(&identity.namespace, &secret)
            .await
            .context(SaveSecretSnafu)?;
        match fingerprint {
            Ok(fingerprint) => info!(
                secret = %name,
                certificate.sha256 = %format!("{:x}", FmtByteSlice(&fingerprint)),
                "Saved certificate"
            ),
            Err(_) => info!(secret = %name, "Saved certificate"),
        }
        Ok(())
    }

    /// Creates the signing request, replacing leftovers of earlier attempts that we own
    async fn send_csr(
        &self,
        identity: &Identity,
        name: &str,
        request_pem: Vec<u8>,
    ) -> Result<CertificateSigningRequest> {
        let csr_ref = csr_ref(name);
        let ownership = self.ownership(identity);
        let mut replacements = 0;
        loop {
            match self
                .authority
                .get(name)
                .await
                .context(GetSigningRequestSnafu)?
            {
                Some(existing) if !ownership.owns(existing.metadata.labels.as_ref()) => {
                    return ForeignSigningRequestSnafu {
                        csr: csr_ref,
                        managed_by: &self.config.managed_by,
                    }
                    .fail();
                }
                Some(_) if replacements >= self.config.max_stale_replacements => {
                    return StaleSigningRequestSnafu {
                        csr: csr_ref,
                        replacements,
                    }
                    .fail();
                }
                Some(_) => {
                    info!(csr = %csr_ref, "Found signing request from an earlier attempt, replacing it");
                    self.authority
                        .delete(name)
                        .await
                        .context(DeleteStaleSigningRequestSnafu)?;
                    replacements += 1;
                }
                None => break,
            }
        }

        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(ownership.labels()),
                ..ObjectMeta::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request_pem),
                signer_name: self.config.signer_name.clone(),
                usages: Some(RequiredUsage::iter().map(|usage| usage.to_string()).collect()),
                ..CertificateSigningRequestSpec::default()
            },
            status: None,
        };
        let created = self
            .authority
            .create(&csr)
            .await
            .context(CreateSigningRequestSnafu)?;
        info!(csr = %csr_ref, "Created signing request");
        Ok(created)
    }

    async fn approve_csr(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest> {
        let mut csr = csr.clone();
        csr.status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
            .push(CertificateSigningRequestCondition {
                type_: CONDITION_APPROVED.to_string(),
                status: "True".to_string(),
                reason: Some(APPROVAL_REASON.to_string()),
                message: Some(format!("Auto approved by {}", self.config.managed_by)),
                ..CertificateSigningRequestCondition::default()
            });
        self.authority
            .update_approval(&csr)
            .await
            .context(ApproveSigningRequestSnafu)
    }

    /// Waits until the signer has issued a certificate for `csr`, returning the PEM-encoded certificate
    async fn wait_for_certificate(&self, csr: &CertificateSigningRequest) -> Result<Vec<u8>> {
        let csr_ref = csr_ref(csr.metadata.name.as_deref().unwrap_or_default());
        let mut events = self
            .authority
            .watch(
                csr.metadata.name.as_deref().unwrap_or_default(),
                *self.config.signing_timeout,
            )
            .await
            .context(WatchSigningRequestSnafu)?;

        let pending_log_interval = *self.config.pending_log_interval;
        let mut pending_log =
            interval_at(Instant::now() + pending_log_interval, pending_log_interval);
        pending_log.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = pending_log.tick() => {
                    info!(csr = %csr_ref, "Signing request has not been signed yet, still waiting");
                }
                event = events.next() => {
                    let observed = match event {
                        Some(Ok(WatchEvent::Added(observed) | WatchEvent::Modified(observed) | WatchEvent::Deleted(observed))) => observed,
                        Some(Ok(WatchEvent::Bookmark(_))) => continue,
                        Some(Ok(WatchEvent::Error(err))) => {
                            warn!(csr = %csr_ref, error = %err, "Watch reported an error");
                            continue;
                        }
                        Some(Err(err)) => return Err(err).context(WatchSigningRequestSnafu),
                        None => return SigningTimeoutSnafu { csr: csr_ref }.fail(),
                    };
                    if let Some(certificate) = signed_certificate(csr, observed) {
                        return Ok(certificate);
                    }
                }
            }
        }
    }
}

/// Returns the certificate of `observed` if it is the approved and signed version of `requested`
fn signed_certificate(
    requested: &CertificateSigningRequest,
    observed: CertificateSigningRequest,
) -> Option<Vec<u8>> {
    if observed.metadata.uid != requested.metadata.uid {
        return None;
    }
    let status = observed.status?;
    let approved = status
        .conditions
        .as_ref()
        .and_then(|conditions| conditions.last())
        .is_some_and(|condition| condition.type_ == CONDITION_APPROVED);
    if !approved {
        return None;
    }
    status
        .certificate
        .map(|certificate| certificate.0)
        .filter(|certificate| !certificate.is_empty())
}
