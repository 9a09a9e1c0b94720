//! PC/SC backed YubiKey adapter, enabled by the `yubikey` feature.

use der::Encode;
use tracing::debug;
use yubikey::piv::{self, AlgorithmId, SlotId};
use yubikey::reader::Context;
use yubikey::{Certificate, YubiKey};

use crate::device::{CardOpener, KeyAlgorithm, PivDevice};
use crate::error::PivError;
use crate::slot::Slot;

fn device_err(e: yubikey::Error) -> PivError {
    PivError::Device(e.to_string())
}

/// Enumerates PC/SC readers with a YubiKey inserted.
#[derive(Debug, Default)]
pub struct YubiKeyOpener;

impl CardOpener for YubiKeyOpener {
    fn cards(&self) -> Result<Vec<String>, PivError> {
        let mut ctx = Context::open().map_err(device_err)?;
        let readers = ctx.iter().map_err(device_err)?;
        Ok(readers.map(|r| r.name().to_string()).collect())
    }

    fn open(&self, card: &str) -> Result<Box<dyn PivDevice>, PivError> {
        let mut ctx = Context::open().map_err(device_err)?;
        for reader in ctx.iter().map_err(device_err)? {
            if reader.name().to_string() == card {
                let yk = reader.open().map_err(device_err)?;
                debug!(card, "yubikey reader opened");
                return Ok(Box::new(YubiKeyDevice {
                    yk,
                    pin_verified: false,
                }));
            }
        }
        Err(PivError::NoDevice)
    }
}

struct YubiKeyDevice {
    yk: YubiKey,
    pin_verified: bool,
}

fn slot_id(slot: Slot) -> Result<SlotId, PivError> {
    SlotId::try_from(slot.key()).map_err(device_err)
}

fn algorithm_id(algorithm: KeyAlgorithm) -> Result<AlgorithmId, PivError> {
    match algorithm {
        KeyAlgorithm::Rsa { bits: 1024 } => Ok(AlgorithmId::Rsa1024),
        KeyAlgorithm::Rsa { bits: 2048 } => Ok(AlgorithmId::Rsa2048),
        KeyAlgorithm::EccP256 => Ok(AlgorithmId::EccP256),
        KeyAlgorithm::EccP384 => Ok(AlgorithmId::EccP384),
        other => Err(PivError::UnsupportedKey(format!("{other:?}"))),
    }
}

impl PivDevice for YubiKeyDevice {
    fn serial(&mut self) -> Result<u32, PivError> {
        Ok(self.yk.serial().0)
    }

    fn attest(&mut self, slot: Slot) -> Result<Vec<u8>, PivError> {
        let der = piv::attest(&mut self.yk, slot_id(slot)?).map_err(device_err)?;
        Ok(der.to_vec())
    }

    fn certificate(&mut self, slot: Slot) -> Result<Vec<u8>, PivError> {
        let cert = Certificate::read(&mut self.yk, slot_id(slot)?).map_err(device_err)?;
        cert.cert
            .to_der()
            .map_err(|e| PivError::Certificate(e.to_string()))
    }

    fn pin_retries(&mut self) -> Result<u8, PivError> {
        self.yk.get_pin_retries().map_err(device_err)
    }

    fn pin_verified(&mut self) -> bool {
        self.pin_verified
    }

    fn verify_pin(&mut self, pin: &[u8]) -> Result<(), PivError> {
        self.yk.verify_pin(pin).map_err(device_err)?;
        self.pin_verified = true;
        Ok(())
    }

    fn sign(
        &mut self,
        slot: Slot,
        algorithm: KeyAlgorithm,
        input: &[u8],
    ) -> Result<Vec<u8>, PivError> {
        let signature = piv::sign_data(&mut self.yk, input, algorithm_id(algorithm)?, slot_id(slot)?)
            .map_err(device_err)?;
        Ok(signature.to_vec())
    }
}
