//! Storage of issued credentials

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::{Api, PostParams},
        runtime::reflector::ObjectRef,
    },
};

/// Field holding the PEM-encoded certificate
pub const SECRET_KEY_CERT: &str = "cert";
/// Field holding the PEM-encoded PKCS#1 private key
pub const SECRET_KEY_KEY: &str = "key";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {secret}"))]
    Get {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to create {secret}"))]
    Create {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Namespaced key/value store for credential [`Secret`]s
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns `None` if the secret does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Fails if the secret already exists
    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret>;
}

pub struct KubeSecretStore {
    client: kube::Client,
}

impl KubeSecretStore {
    pub fn new(client: &stackable_operator::client::Client) -> Self {
        Self {
            client: client.as_kube_client(),
        }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.api(namespace)
            .get_opt(name)
            .await
            .with_context(|_| GetSnafu {
                secret: ObjectRef::new(name).within(namespace),
            })
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        self.api(namespace)
            .create(&PostParams::default(), secret)
            .await
            .with_context(|_| CreateSnafu {
                secret: ObjectRef::new(secret.metadata.name.as_deref().unwrap_or_default())
                    .within(namespace),
            })
    }
}
