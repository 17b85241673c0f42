//! Throwaway certificate authority for tests

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, PKeyRef, Private, Public},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectKeyIdentifier,
        },
        X509Builder, X509NameBuilder, X509NameRef, X509Req, X509,
    },
};

const DAY_SECS: i64 = 24 * 60 * 60;

/// Which extended key usages an issued certificate should carry
#[derive(Clone, Copy, Debug)]
pub struct LeafUsages {
    pub client_auth: bool,
    pub server_auth: bool,
}

impl LeafUsages {
    pub const BOTH: Self = Self {
        client_auth: true,
        server_auth: true,
    };
}

/// Validity window of an issued certificate, in seconds relative to now
#[derive(Clone, Copy, Debug)]
pub struct Validity {
    pub not_before: i64,
    pub not_after: i64,
}

impl Validity {
    pub const CURRENT: Self = Self {
        not_before: -300,
        not_after: DAY_SECS,
    };
    pub const EXPIRED: Self = Self {
        not_before: -2 * DAY_SECS,
        not_after: -DAY_SECS,
    };
}

pub struct TestCa {
    pub cert: X509,
    pub key: PKey<Private>,
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn random_serial() -> Asn1Integer {
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    Asn1Integer::from_bn(&serial).unwrap()
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let key = Rsa::generate(2048).and_then(PKey::from_rsa).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)
            .unwrap();
        let name = name.build();
        let conf = Conf::new(ConfMethod::default()).unwrap();
        let mut x509 = X509Builder::new().unwrap();
        x509.set_subject_name(&name).unwrap();
        x509.set_issuer_name(&name).unwrap();
        x509.set_not_before(&Asn1Time::from_unix(now() - 300).unwrap())
            .unwrap();
        x509.set_not_after(&Asn1Time::from_unix(now() + 365 * DAY_SECS).unwrap())
            .unwrap();
        x509.set_pubkey(&key).unwrap();
        x509.set_serial_number(&random_serial()).unwrap();
        x509.set_version(3 - 1).unwrap();
        let ctx = x509.x509v3_context(None, Some(&conf));
        let exts = [
            BasicConstraints::new().critical().ca().build().unwrap(),
            SubjectKeyIdentifier::new().build(&ctx).unwrap(),
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        ];
        for ext in exts {
            x509.append_extension(ext).unwrap();
        }
        x509.sign(&key, MessageDigest::sha256()).unwrap();
        Self {
            cert: x509.build(),
            key,
        }
    }

    pub fn cert_pem(&self) -> Vec<u8> {
        self.cert.to_pem().unwrap()
    }

    /// Issue a certificate for `pubkey`
    pub fn issue(
        &self,
        subject_name: &X509NameRef,
        pubkey: &PKeyRef<Public>,
        usages: LeafUsages,
        validity: Validity,
    ) -> X509 {
        let conf = Conf::new(ConfMethod::default()).unwrap();
        let mut x509 = X509Builder::new().unwrap();
        x509.set_subject_name(subject_name).unwrap();
        x509.set_issuer_name(self.cert.subject_name()).unwrap();
        x509.set_not_before(&Asn1Time::from_unix(now() + validity.not_before).unwrap())
            .unwrap();
        x509.set_not_after(&Asn1Time::from_unix(now() + validity.not_after).unwrap())
            .unwrap();
        x509.set_pubkey(pubkey).unwrap();
        x509.set_serial_number(&random_serial()).unwrap();
        x509.set_version(3 - 1).unwrap();
        let ctx = x509.x509v3_context(Some(&self.cert), Some(&conf));
        let mut exts = vec![
            BasicConstraints::new().critical().build().unwrap(),
            KeyUsage::new()
                .key_encipherment()
                .digital_signature()
                .build()
                .unwrap(),
            SubjectKeyIdentifier::new().build(&ctx).unwrap(),
            AuthorityKeyIdentifier::new()
                .issuer(true)
                .keyid(true)
                .build(&ctx)
                .unwrap(),
        ];
        // Certificates without any extended key usage are valid for every purpose,
        // so always restrict them to something
        let mut eku = ExtendedKeyUsage::new();
        eku.code_signing();
        if usages.client_auth {
            eku.client_auth();
        }
        if usages.server_auth {
            eku.server_auth();
        }
        exts.push(eku.build().unwrap());
        for ext in exts {
            x509.append_extension(ext).unwrap();
        }
        x509.sign(&self.key, MessageDigest::sha256()).unwrap();
        x509.build()
    }

    /// Sign a PEM-encoded certificate signing request, the way the cluster's signer would
    pub fn sign_request_pem(&self, request_pem: &[u8]) -> Vec<u8> {
        let req = X509Req::from_pem(request_pem).unwrap();
        let pubkey = req.public_key().unwrap();
        self.issue(
            req.subject_name(),
            &pubkey,
            LeafUsages::BOTH,
            Validity::CURRENT,
        )
        .to_pem()
        .unwrap()
    }

    /// Issue a brand new key pair, returning `(cert_pem, key_pem)`
    pub fn issue_leaf(&self, usages: LeafUsages, validity: Validity) -> (Vec<u8>, Vec<u8>) {
        let rsa = Rsa::generate(2048).unwrap();
        let key_pem = rsa.private_key_to_pem().unwrap();
        let pubkey = PKey::public_key_from_pem(&rsa.public_key_to_pem().unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, "leaf").unwrap();
        let cert = self.issue(&name.build(), &pubkey, usages, validity);
        (cert.to_pem().unwrap(), key_pem)
    }
}

/// Trusted roots that never change
pub struct StaticRoots(pub Vec<X509>);

impl crate::trust_roots::TrustedRoots for StaticRoots {
    fn read_trusted_roots(&self) -> Result<Vec<X509>, crate::trust_roots::Error> {
        Ok(self.0.clone())
    }
}
