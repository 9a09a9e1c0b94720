//! Slot certificate parsing: public key, key algorithm, and PIN policy.

use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use x509_cert::Certificate;

use crate::device::KeyAlgorithm;
use crate::error::PivError;

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// Yubico attestation extension carrying the PIN and touch policies.
const YUBICO_POLICY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.41482.3.8");

/// When the token demands PIN verification before a private-key operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPolicy {
    /// No policy information; treated like [`PinPolicy::Once`].
    Default,
    Never,
    Once,
    Always,
}

impl PinPolicy {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => PinPolicy::Never,
            2 => PinPolicy::Once,
            3 => PinPolicy::Always,
            _ => PinPolicy::Default,
        }
    }

    /// Whether a prompt is needed given the card's current verification state.
    pub fn requires_pin(&self, already_verified: bool) -> bool {
        match self {
            PinPolicy::Never => false,
            PinPolicy::Always => true,
            PinPolicy::Once | PinPolicy::Default => !already_verified,
        }
    }
}

/// What the signer needs to know about a slot's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCertificate {
    spki_der: Vec<u8>,
    algorithm: KeyAlgorithm,
    pin_policy: PinPolicy,
}

impl SlotCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self, PivError> {
        let cert = Certificate::from_der(der).map_err(cert_err)?;
        let tbs = &cert.tbs_certificate;
        let spki = &tbs.subject_public_key_info;

        let algorithm = if spki.algorithm.oid == RSA_ENCRYPTION {
            let key = rsa::RsaPublicKey::from_pkcs1_der(spki.subject_public_key.raw_bytes())
                .map_err(|e| PivError::Certificate(format!("RSA public key: {e}")))?;
            KeyAlgorithm::Rsa {
                bits: key.size() * 8,
            }
        } else if spki.algorithm.oid == EC_PUBLIC_KEY {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.decode_as::<ObjectIdentifier>().ok());
            match curve {
                Some(c) if c == SECP256R1 => KeyAlgorithm::EccP256,
                Some(c) if c == SECP384R1 => KeyAlgorithm::EccP384,
                Some(c) => return Err(PivError::UnsupportedKey(format!("curve {c}"))),
                None => return Err(PivError::UnsupportedKey("EC key without named curve".into())),
            }
        } else {
            return Err(PivError::UnsupportedKey(spki.algorithm.oid.to_string()));
        };

        let pin_policy = tbs
            .extensions
            .iter()
            .flatten()
            .find(|ext| ext.extn_id == YUBICO_POLICY)
            .and_then(|ext| ext.extn_value.as_bytes().first().copied())
            .map(PinPolicy::from_byte)
            .unwrap_or(PinPolicy::Default);

        let spki_der = spki.to_der().map_err(cert_err)?;
        Ok(Self {
            spki_der,
            algorithm,
            pin_policy,
        })
    }

    /// DER `SubjectPublicKeyInfo`.
    pub fn public_key_der(&self) -> &[u8] {
        &self.spki_der
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn pin_policy(&self) -> PinPolicy {
        self.pin_policy
    }
}

fn cert_err(e: der::Error) -> PivError {
    PivError::Certificate(e.to_string())
}
