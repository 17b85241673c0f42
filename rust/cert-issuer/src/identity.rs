/// Describes who a certificate is issued for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub namespace: String,
    /// The instance that owns the certificate, such as a `Pod` name
    pub instance: String,
    pub component: String,
    /// Distinguishes multiple certificates of the same instance (for example `peer` and `client`)
    pub suffix: String,
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<String>,
}

impl Identity {
    /// Name of both the `CertificateSigningRequest` and the credential `Secret`
    ///
    /// This is `instance` if there is no suffix, and `instance-suffix` otherwise.
    pub fn resource_name(&self) -> String {
        if self.suffix.is_empty() {
            self.instance.clone()
        } else {
            format!("{}-{}", self.instance, self.suffix)
        }
    }
}
