use agentx_core::{PinPrompt, PinRequest};
use tracing::debug;

use crate::cert::SlotCertificate;
use crate::device::{KeyAlgorithm, PivDevice};
use crate::error::PivError;
use crate::slot::Slot;

/// Length of the SHA-256 digests accepted by [`SlotSigner::sign`].
pub const DIGEST_LEN: usize = 32;

/// DER DigestInfo prefix for SHA-256 (RFC 8017 section 9.2, note 1).
const SHA256_DIGEST_INFO: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
    0x00, 0x04, 0x20,
];

/// Signer bound to one slot, built from the slot's attestation certificate or,
/// failing that, its stored certificate.
#[derive(Debug, Clone)]
pub struct SlotSigner {
    slot: Slot,
    certificate: SlotCertificate,
}

impl SlotSigner {
    pub fn build(device: &mut dyn PivDevice, slot: Slot) -> Result<Self, PivError> {
        let der = match device.attest(slot) {
            Ok(der) => der,
            Err(attest_err) => {
                debug!(slot = %slot, error = %attest_err, "attestation unavailable, reading stored certificate");
                device.certificate(slot)?
            }
        };
        let certificate = SlotCertificate::from_der(&der)?;
        debug!(
            slot = %slot,
            algorithm = ?certificate.algorithm(),
            pin_policy = ?certificate.pin_policy(),
            "slot signer ready"
        );
        Ok(Self { slot, certificate })
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn certificate(&self) -> &SlotCertificate {
        &self.certificate
    }

    /// Sign a SHA-256 digest, asking for the PIN first when the slot's policy
    /// and the card's verification state require it.
    pub fn sign(
        &self,
        device: &mut dyn PivDevice,
        prompt: &dyn PinPrompt,
        serial: u32,
        digest: &[u8],
    ) -> Result<Vec<u8>, PivError> {
        let algorithm = self.certificate.algorithm();
        let input = signature_input(algorithm, digest)?;

        if self
            .certificate
            .pin_policy()
            .requires_pin(device.pin_verified())
        {
            let retries = device.pin_retries()?;
            let pin = prompt.request_pin(&PinRequest { serial, retries })?;
            device.verify_pin(pin.as_bytes())?;
        }

        device.sign(self.slot, algorithm, &input)
    }
}

/// Turn a SHA-256 digest into the raw input for the card's private-key
/// operation: EMSA-PKCS1-v1_5 for RSA, the digest sized to the field for ECC.
pub fn signature_input(algorithm: KeyAlgorithm, digest: &[u8]) -> Result<Vec<u8>, PivError> {
    if digest.len() != DIGEST_LEN {
        return Err(PivError::InvalidDigest {
            expected: DIGEST_LEN,
            actual: digest.len(),
        });
    }

    let len = algorithm.input_len();
    match algorithm {
        KeyAlgorithm::Rsa { .. } => {
            let t_len = SHA256_DIGEST_INFO.len() + digest.len();
            if len < t_len + 11 {
                return Err(PivError::UnsupportedKey(format!(
                    "RSA modulus of {len} bytes is too short for PKCS#1 v1.5"
                )));
            }
            let mut em = Vec::with_capacity(len);
            em.extend_from_slice(&[0x00, 0x01]);
            em.resize(len - t_len - 1, 0xff);
            em.push(0x00);
            em.extend_from_slice(&SHA256_DIGEST_INFO);
            em.extend_from_slice(digest);
            Ok(em)
        }
        KeyAlgorithm::EccP256 | KeyAlgorithm::EccP384 => {
            let mut input = vec![0u8; len.saturating_sub(digest.len())];
            input.extend_from_slice(&digest[..digest.len().min(len)]);
            Ok(input)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use agentx_core::PromptError;
    use zeroize::Zeroizing;

    use super::*;
    use crate::fake::{FakeCard, P256_ATTESTATION, P256_NEVER_ATTESTATION, RSA_STORED_CERT};

    struct StaticPin(&'static str);

    impl PinPrompt for StaticPin {
        fn request_pin(&self, _: &PinRequest) -> Result<Zeroizing<String>, PromptError> {
            Ok(Zeroizing::new(self.0.to_string()))
        }
    }

    struct Cancels;

    impl PinPrompt for Cancels {
        fn request_pin(&self, _: &PinRequest) -> Result<Zeroizing<String>, PromptError> {
            Err(PromptError::Cancelled)
        }
    }

    fn slot() -> Slot {
        Slot::lookup("9a").unwrap()
    }

    #[test]
    fn rsa_input_is_pkcs1_padded() {
        let digest = [0xabu8; 32];
        let em = signature_input(KeyAlgorithm::Rsa { bits: 2048 }, &digest).unwrap();
        assert_eq!(em.len(), 256);
        assert_eq!(&em[..2], &[0x00, 0x01]);
        let sep = 256 - 32 - 19 - 1;
        assert!(em[2..sep].iter().all(|b| *b == 0xff));
        assert_eq!(em[sep], 0x00);
        assert_eq!(&em[sep + 1..sep + 20], &SHA256_DIGEST_INFO);
        assert_eq!(&em[256 - 32..], &digest);
    }

    #[test]
    fn ecc_input_is_sized_to_field() {
        let digest = [7u8; 32];
        assert_eq!(
            signature_input(KeyAlgorithm::EccP256, &digest).unwrap(),
            digest.to_vec()
        );
        let p384 = signature_input(KeyAlgorithm::EccP384, &digest).unwrap();
        assert_eq!(p384.len(), 48);
        assert!(p384[..16].iter().all(|b| *b == 0));
        assert_eq!(&p384[16..], &digest);
    }

    #[test]
    fn digest_length_is_checked() {
        assert!(matches!(
            signature_input(KeyAlgorithm::EccP256, b"short"),
            Err(PivError::InvalidDigest {
                expected: 32,
                actual: 5
            })
        ));
    }

    #[test]
    fn build_falls_back_to_stored_certificate() {
        let mut card = FakeCard::new(1).with_certificate("9a", RSA_STORED_CERT);
        let counters = card.counters();
        let signer = SlotSigner::build(&mut card, slot()).unwrap();
        assert_eq!(
            signer.certificate().algorithm(),
            KeyAlgorithm::Rsa { bits: 2048 }
        );
        assert_eq!(counters.attest.load(Ordering::SeqCst), 1);
        assert_eq!(counters.certificate.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn build_fails_without_any_certificate() {
        let mut card = FakeCard::new(1);
        assert!(SlotSigner::build(&mut card, slot()).is_err());
    }

    #[test]
    fn once_policy_prompts_only_first_time() {
        let mut card = FakeCard::new(7).with_certificate("9a", RSA_STORED_CERT);
        let counters = card.counters();
        let signer = SlotSigner::build(&mut card, slot()).unwrap();
        let digest = [1u8; 32];
        signer.sign(&mut card, &StaticPin("123456"), 7, &digest).unwrap();
        signer.sign(&mut card, &StaticPin("123456"), 7, &digest).unwrap();
        assert_eq!(counters.verify_pin.load(Ordering::SeqCst), 1);
        assert_eq!(counters.sign.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn always_policy_prompts_every_time() {
        let mut card = FakeCard::new(7).with_attestation("9a", P256_ATTESTATION);
        let counters = card.counters();
        let signer = SlotSigner::build(&mut card, slot()).unwrap();
        for _ in 0..3 {
            signer.sign(&mut card, &StaticPin("123456"), 7, &[2u8; 32]).unwrap();
        }
        assert_eq!(counters.verify_pin.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn never_policy_skips_prompt() {
        let mut card = FakeCard::new(7).with_attestation("9a", P256_NEVER_ATTESTATION);
        let counters = card.counters();
        let signer = SlotSigner::build(&mut card, slot()).unwrap();
        let sig = signer.sign(&mut card, &Cancels, 7, &[3u8; 32]).unwrap();
        assert!(!sig.is_empty());
        assert_eq!(counters.verify_pin.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_prompt_aborts_sign() {
        let mut card = FakeCard::new(7).with_attestation("9a", P256_ATTESTATION);
        let counters = card.counters();
        let signer = SlotSigner::build(&mut card, slot()).unwrap();
        let err = signer.sign(&mut card, &Cancels, 7, &[3u8; 32]).unwrap_err();
        assert!(matches!(err, PivError::PinPrompt(PromptError::Cancelled)));
        assert_eq!(counters.sign.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wrong_pin_is_reported_not_retried() {
        let mut card = FakeCard::new(7).with_attestation("9a", P256_ATTESTATION);
        let counters = card.counters();
        let signer = SlotSigner::build(&mut card, slot()).unwrap();
        let err = signer.sign(&mut card, &StaticPin("000000"), 7, &[3u8; 32]).unwrap_err();
        assert!(matches!(err, PivError::Device(_)));
        assert_eq!(counters.verify_pin.load(Ordering::SeqCst), 1);
        assert_eq!(counters.sign.load(Ordering::SeqCst), 0);
    }
}
