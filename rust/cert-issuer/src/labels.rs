//! Labels used to tag (and later recognize) objects managed by the issuer

use std::collections::BTreeMap;

pub const LABEL_NAMESPACE: &str = "app.kubernetes.io/namespace";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Ownership of a managed object, as expressed through its labels
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ownership<'a> {
    pub namespace: &'a str,
    pub managed_by: &'a str,
    pub instance: &'a str,
}

impl Ownership<'_> {
    /// Labels for a `CertificateSigningRequest`
    pub fn labels(&self) -> BTreeMap<String, String> {
        [
            (LABEL_NAMESPACE, self.namespace),
            (LABEL_MANAGED_BY, self.managed_by),
            (LABEL_INSTANCE, self.instance),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    /// Labels for a credential `Secret`, which additionally record the component
    pub fn labels_with_component(&self, component: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
        labels
    }

    /// Whether `labels` mark an object as owned by us
    ///
    /// Extra labels are tolerated, but all ownership labels must be present and equal.
    pub fn owns(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let Some(labels) = labels else {
            return false;
        };
        let has = |key: &str, value: &str| labels.get(key).map(String::as_str) == Some(value);
        has(LABEL_NAMESPACE, self.namespace)
            && has(LABEL_MANAGED_BY, self.managed_by)
            && has(LABEL_INSTANCE, self.instance)
    }
}
