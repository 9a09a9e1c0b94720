//! Port to a physical PIV token.
//!
//! Every method is one device transaction.  Callers are responsible for
//! never running two of them at once against the same card; the
//! [`HardwareSigner`](crate::HardwareSigner) does so by holding its lock for
//! the whole operation.

use crate::error::PivError;
use crate::slot::Slot;

/// Key type of a slot, as far as signature input formatting is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa { bits: usize },
    EccP256,
    EccP384,
}

impl KeyAlgorithm {
    /// Length of the raw input the card expects for GENERAL AUTHENTICATE.
    pub fn input_len(&self) -> usize {
        match self {
            KeyAlgorithm::Rsa { bits } => bits / 8,
            KeyAlgorithm::EccP256 => 32,
            KeyAlgorithm::EccP384 => 48,
        }
    }
}

pub trait PivDevice: Send {
    fn serial(&mut self) -> Result<u32, PivError>;

    /// DER attestation certificate for a key generated on the card.
    fn attest(&mut self, slot: Slot) -> Result<Vec<u8>, PivError>;

    /// DER certificate stored in the slot's data object.
    fn certificate(&mut self, slot: Slot) -> Result<Vec<u8>, PivError>;

    fn pin_retries(&mut self) -> Result<u8, PivError>;

    /// Whether the PIN has already been verified on this card handle.
    fn pin_verified(&mut self) -> bool;

    fn verify_pin(&mut self, pin: &[u8]) -> Result<(), PivError>;

    /// Raw private-key operation over `input`, which must already be padded
    /// (RSA) or sized to the curve (ECC).
    fn sign(
        &mut self,
        slot: Slot,
        algorithm: KeyAlgorithm,
        input: &[u8],
    ) -> Result<Vec<u8>, PivError>;
}

/// Enumerates and opens cards.
pub trait CardOpener: Send + Sync {
    fn cards(&self) -> Result<Vec<String>, PivError>;

    fn open(&self, card: &str) -> Result<Box<dyn PivDevice>, PivError>;
}
