//! Access to the cluster's certificate signing authority, through `CertificateSigningRequest` objects

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::certificates::v1::CertificateSigningRequest,
    kube::{
        self,
        api::{Api, DeleteParams, PostParams, WatchEvent, WatchParams},
        runtime::reflector::ObjectRef,
    },
};
use tokio::time::Instant;
use tracing::debug;

/// The API server refuses (or the client times out) watches that last longer than this,
/// longer waits are split into several consecutive watch requests.
const MAX_WATCH_REQUEST_SECS: u64 = 290;

/// Makes the API server start by replaying the current state of the object
const INITIAL_RESOURCE_VERSION: &str = "0";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {csr}"))]
    Get {
        source: kube::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("failed to create {csr}"))]
    Create {
        source: kube::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("failed to delete {csr}"))]
    Delete {
        source: kube::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("failed to serialize approval of {csr}"))]
    SerializeApproval {
        source: serde_json::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("failed to update approval of {csr}"))]
    UpdateApproval {
        source: kube::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("failed to watch {csr}"))]
    Watch {
        source: kube::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

pub type WatchStream = BoxStream<'static, Result<WatchEvent<CertificateSigningRequest>>>;

pub fn csr_ref(name: &str) -> ObjectRef<CertificateSigningRequest> {
    ObjectRef::new(name)
}

fn csr_name(csr: &CertificateSigningRequest) -> &str {
    csr.metadata.name.as_deref().unwrap_or_default()
}

/// A certificate signing authority that we may both request certificates from and approve requests for
#[async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Returns `None` if no request with the name exists
    async fn get(&self, name: &str) -> Result<Option<CertificateSigningRequest>>;

    async fn create(&self, csr: &CertificateSigningRequest) -> Result<CertificateSigningRequest>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Submits the status conditions of `csr`, this requires the approver role for the request's signer.
    async fn update_approval(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest>;

    /// Watches the request called `name`
    ///
    /// The current state of the request is delivered first, so that changes made before
    /// the watch was established are not lost.
    /// The stream ends once `timeout` has elapsed. Items after an `Err` are not expected.
    async fn watch(&self, name: &str, timeout: Duration) -> Result<WatchStream>;
}

pub struct KubeSigningAuthority {
    api: Api<CertificateSigningRequest>,
}

impl KubeSigningAuthority {
    pub fn new(client: &stackable_operator::client::Client) -> Self {
        Self {
            api: Api::all(client.as_kube_client()),
        }
    }
}

#[async_trait]
impl SigningAuthority for KubeSigningAuthority {
    async fn get(&self, name: &str) -> Result<Option<CertificateSigningRequest>> {
        self.api
            .get_opt(name)
            .await
            .context(GetSnafu { csr: csr_ref(name) })
    }

    async fn create(&self, csr: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
        self.api
            .create(&PostParams::default(), csr)
            .await
            .with_context(|_| CreateSnafu {
                csr: csr_ref(csr_name(csr)),
            })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .context(DeleteSnafu { csr: csr_ref(name) })?;
        Ok(())
    }

    async fn update_approval(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest> {
        let name = csr_name(csr);
        let body = serde_json::to_vec(csr).context(SerializeApprovalSnafu { csr: csr_ref(name) })?;
        self.api
            .replace_subresource("approval", name, &PostParams::default(), body)
            .await
            .context(UpdateApprovalSnafu { csr: csr_ref(name) })
    }

    async fn watch(&self, name: &str, timeout: Duration) -> Result<WatchStream> {
        let mut state = WatchState {
            api: self.api.clone(),
            name: name.to_string(),
            resource_version: INITIAL_RESOURCE_VERSION.to_string(),
            deadline: Instant::now() + timeout,
            events: None,
        };
        state
            .start_request()
            .await
            .context(WatchSnafu { csr: csr_ref(name) })?;
        Ok(futures::stream::unfold(state, WatchState::next).boxed())
    }
}

/// Chains watch requests until the deadline has passed, resuming from the last seen resource version.
struct WatchState {
    api: Api<CertificateSigningRequest>,
    name: String,
    resource_version: String,
    deadline: Instant,
    events: Option<BoxStream<'static, kube::Result<WatchEvent<CertificateSigningRequest>>>>,
}

impl WatchState {
    async fn next(mut self) -> Option<(Result<WatchEvent<CertificateSigningRequest>>, Self)> {
        loop {
            if let Some(events) = &mut self.events {
                match events.next().await {
                    Some(Ok(event)) => {
                        track_resource_version(&mut self.resource_version, &event);
                        return Some((Ok(event), self));
                    }
                    Some(Err(err)) => {
                        let csr = csr_ref(&self.name);
                        return Some((Err(err).context(WatchSnafu { csr }), self));
                    }
                    None => self.events = None,
                }
            }

            match self.start_request().await {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    let csr = csr_ref(&self.name);
                    // The stream ends after reporting the error
                    self.deadline = Instant::now();
                    return Some((Err(err).context(WatchSnafu { csr }), self));
                }
            }
        }
    }

    /// Opens the next watch request, returns `false` once the deadline has passed
    async fn start_request(&mut self) -> kube::Result<bool> {
        let Some(timeout_secs) =
            request_timeout_secs(self.deadline.saturating_duration_since(Instant::now()))
        else {
            return Ok(false);
        };
        debug!(
            csr = %csr_ref(&self.name),
            resource_version = %self.resource_version,
            timeout_secs,
            "Starting watch request"
        );
        let params = WatchParams::default()
            .fields(&format!("metadata.name={}", self.name))
            .timeout(timeout_secs);
        let events = self.api.watch(&params, &self.resource_version).await?;
        self.events = Some(events.boxed());
        Ok(true)
    }
}

/// Server-side timeout of the next watch request, `None` if less than a second remains
fn request_timeout_secs(remaining: Duration) -> Option<u32> {
    match remaining.as_secs() {
        0 => None,
        secs => Some(secs.min(MAX_WATCH_REQUEST_SECS) as u32),
    }
}

/// Updates the resource version that the next watch request resumes from
fn track_resource_version(
    resource_version: &mut String,
    event: &WatchEvent<CertificateSigningRequest>,
) {
    match event {
        WatchEvent::Added(csr) | WatchEvent::Modified(csr) | WatchEvent::Deleted(csr) => {
            if let Some(observed) = &csr.metadata.resource_version {
                resource_version.clone_from(observed);
            }
        }
        // The resource version we were following has been compacted away, start over
        WatchEvent::Error(err) if err.code == 410 => {
            *resource_version = INITIAL_RESOURCE_VERSION.to_string()
        }
        _ => {}
    }
}
