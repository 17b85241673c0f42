//! Generates private keys and PKCS#10 certificate signing requests

use std::net::{AddrParseError, IpAddr};

use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::PKey,
    rsa::Rsa,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req, X509ReqBuilder},
};
use snafu::{ResultExt, Snafu};

use crate::utils::Unloggable;

pub const RSA_KEY_BITS: u32 = 2048;

const ORGANIZATION: &str = "Stackable";
const ORGANIZATIONAL_UNIT: &str = "Certificate Issuer";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate private key"))]
    GenerateKey { source: ErrorStack },

    #[snafu(display("{address:?} is not a valid IP address"))]
    InvalidIpAddress {
        source: AddrParseError,
        address: String,
    },

    #[snafu(display("failed to build certificate signing request"))]
    BuildRequest { source: ErrorStack },

    #[snafu(display("failed to serialize {tpe:?}"))]
    Serialize {
        source: ErrorStack,
        tpe: ArtifactType,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum ArtifactType {
    PrivateKey,
    Request,
}

/// A freshly generated signing request, along with the private key that it was signed with
#[derive(Debug)]
pub struct GeneratedRequest {
    /// DER-encoded PKCS#10 request
    pub request_der: Vec<u8>,
    /// PEM-encoded PKCS#1 RSA private key
    pub key_pem: Unloggable<Vec<u8>>,
}

/// Generate a new RSA key pair, and a certificate signing request for it
///
/// Every entry in `ip_addresses` must be a valid IPv4 or IPv6 address.
pub fn generate_csr(
    common_name: &str,
    dns_names: &[String],
    ip_addresses: &[String],
) -> Result<GeneratedRequest> {
    let ip_addresses = ip_addresses
        .iter()
        .map(|address| {
            address
                .parse::<IpAddr>()
                .context(InvalidIpAddressSnafu { address })
        })
        .collect::<Result<Vec<_>>>()?;

    let rsa = Rsa::generate(RSA_KEY_BITS).context(GenerateKeySnafu)?;
    let key_pem = rsa.private_key_to_pem().context(SerializeSnafu {
        tpe: ArtifactType::PrivateKey,
    })?;
    let key = PKey::from_rsa(rsa).context(GenerateKeySnafu)?;

    let request = X509ReqBuilder::new()
        .and_then(|mut req| {
            let subject_name = X509NameBuilder::new()
                .and_then(|mut name| {
                    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, ORGANIZATION)?;
                    name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, ORGANIZATIONAL_UNIT)?;
                    if !common_name.is_empty() {
                        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
                    }
                    Ok(name)
                })?
                .build();
            req.set_subject_name(&subject_name)?;
            req.set_version(
                0, // zero-indexed, PKCS#10 only defines v1
            )?;
            req.set_pubkey(&key)?;
            if !dns_names.is_empty() || !ip_addresses.is_empty() {
                let mut san_ext = SubjectAlternativeName::new();
                for dns in dns_names {
                    san_ext.dns(dns);
                }
                for ip in &ip_addresses {
                    san_ext.ip(&ip.to_string());
                }
                let mut exts = Stack::new()?;
                exts.push(san_ext.build(&req.x509v3_context(None))?)?;
                req.add_extensions(&exts)?;
            }
            req.sign(&key, MessageDigest::sha256())?;
            Ok(req)
        })
        .context(BuildRequestSnafu)?
        .build();

    Ok(GeneratedRequest {
        request_der: request.to_der().context(SerializeSnafu {
            tpe: ArtifactType::Request,
        })?,
        key_pem: Unloggable(key_pem),
    })
}

/// Wraps a DER-encoded request into a `CERTIFICATE REQUEST` PEM block
pub fn request_to_pem(request_der: &[u8]) -> Result<Vec<u8>> {
    X509Req::from_der(request_der)
        .and_then(|req| req.to_pem())
        .context(SerializeSnafu {
            tpe: ArtifactType::Request,
        })
}
