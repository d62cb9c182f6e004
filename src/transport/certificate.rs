use dtls::crypto::{CryptoPrivateKey, CryptoPrivateKeyKind};
use rcgen::{CertificateParams, KeyPair};
use ring::rand::SystemRandom;
use ring::signature::EcdsaKeyPair;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::util::math_rand_alpha;

use crate::error::{Error, Result};

/// Hash algorithm and value identifying a DTLS certificate, RFC 4572 style.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// Self-signed ECDSA P-256 certificate backing the DTLS endpoint of a
/// transport.
#[derive(Clone)]
pub struct Certificate {
    pub(crate) dtls_certificate: dtls::crypto::Certificate,
}

impl Certificate {
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::ErrCertificate(e.to_string()))?;

        let params = CertificateParams::new(vec![math_rand_alpha(16)])
            .map_err(|e| Error::ErrCertificate(e.to_string()))?;
        let x509_cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::ErrCertificate(e.to_string()))?;

        let serialized_der = key_pair.serialize_der();
        let private_key = CryptoPrivateKey {
            kind: CryptoPrivateKeyKind::Ecdsa256(
                EcdsaKeyPair::from_pkcs8(
                    &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
                    &serialized_der,
                    &SystemRandom::new(),
                )
                .map_err(|e| Error::ErrCertificate(e.to_string()))?,
            ),
            serialized_der,
        };

        Ok(Self {
            dtls_certificate: dtls::crypto::Certificate {
                certificate: vec![rustls::Certificate(x509_cert.der().to_vec())],
                private_key,
            },
        })
    }

    pub fn get_fingerprints(&self) -> Vec<DtlsFingerprint> {
        self.dtls_certificate
            .certificate
            .iter()
            .map(|c| DtlsFingerprint {
                algorithm: "sha-256".to_owned(),
                value: fingerprint_value(c.as_ref()),
            })
            .collect()
    }
}

pub(crate) fn fingerprint_value(der: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(der);
    let hashed = h.finalize();
    let values: Vec<String> = hashed.iter().map(|x| format!("{x:02x}")).collect();
    values.join(":")
}

#[cfg(test)]
mod certificate_test {
    use super::*;

    #[test]
    fn test_generate_and_fingerprint() {
        let certificate = Certificate::generate().unwrap();
        let fingerprints = certificate.get_fingerprints();

        assert_eq!(fingerprints.len(), 1);
        assert_eq!(fingerprints[0].algorithm, "sha-256");
        // 32 hash bytes, colon separated
        assert_eq!(fingerprints[0].value.len(), 32 * 3 - 1);
    }
}
