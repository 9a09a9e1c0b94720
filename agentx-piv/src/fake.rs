//! Scripted in-memory token for tests.
//!
//! Signatures are not real: the "signature" is the slot id followed by the
//! input the card received, which lets tests check padding and routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device::{CardOpener, KeyAlgorithm, PivDevice};
use crate::error::PivError;
use crate::slot::Slot;

/// P-256 attestation certificate with PIN policy "always".
pub const P256_ATTESTATION: &[u8] = include_bytes!("../testdata/p256_attest.der");
/// Same key as [`P256_ATTESTATION`], PIN policy "never".
pub const P256_NEVER_ATTESTATION: &[u8] = include_bytes!("../testdata/p256_never.der");
/// DER SubjectPublicKeyInfo of both P-256 certificates.
pub const P256_SPKI: &[u8] = include_bytes!("../testdata/p256_spki.der");
/// RSA-2048 certificate without Yubico extensions.
pub const RSA_STORED_CERT: &[u8] = include_bytes!("../testdata/rsa_stored.der");
pub const RSA_SPKI: &[u8] = include_bytes!("../testdata/rsa_spki.der");

/// Call counters shared by every clone of a [`FakeCard`].
#[derive(Debug, Clone, Default)]
pub struct FakeCounters {
    pub attest: Arc<AtomicUsize>,
    pub certificate: Arc<AtomicUsize>,
    pub verify_pin: Arc<AtomicUsize>,
    pub sign: Arc<AtomicUsize>,
    /// Sign transactions currently running.
    pub active: Arc<AtomicUsize>,
    /// Highest value `active` ever reached.
    pub max_active: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
pub struct FakeCard {
    serial: u32,
    pin: String,
    retries: u8,
    verified: bool,
    attestations: HashMap<&'static str, Vec<u8>>,
    certificates: HashMap<&'static str, Vec<u8>>,
    sign_delay: Duration,
    counters: FakeCounters,
}

impl FakeCard {
    /// A card with PIN "123456" and nothing in any slot.
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            pin: "123456".to_string(),
            retries: 3,
            verified: false,
            attestations: HashMap::new(),
            certificates: HashMap::new(),
            sign_delay: Duration::ZERO,
            counters: FakeCounters::default(),
        }
    }

    pub fn with_attestation(mut self, slot: &'static str, der: &[u8]) -> Self {
        self.attestations.insert(slot, der.to_vec());
        self
    }

    pub fn with_certificate(mut self, slot: &'static str, der: &[u8]) -> Self {
        self.certificates.insert(slot, der.to_vec());
        self
    }

    pub fn with_sign_delay(mut self, delay: Duration) -> Self {
        self.sign_delay = delay;
        self
    }

    pub fn counters(&self) -> FakeCounters {
        self.counters.clone()
    }
}

impl PivDevice for FakeCard {
    fn serial(&mut self) -> Result<u32, PivError> {
        Ok(self.serial)
    }

    fn attest(&mut self, slot: Slot) -> Result<Vec<u8>, PivError> {
        self.counters.attest.fetch_add(1, Ordering::SeqCst);
        self.attestations
            .get(slot.id())
            .cloned()
            .ok_or_else(|| PivError::Device(format!("no attestation for slot {slot}")))
    }

    fn certificate(&mut self, slot: Slot) -> Result<Vec<u8>, PivError> {
        self.counters.certificate.fetch_add(1, Ordering::SeqCst);
        self.certificates
            .get(slot.id())
            .cloned()
            .ok_or_else(|| PivError::Device(format!("no certificate in slot {slot}")))
    }

    fn pin_retries(&mut self) -> Result<u8, PivError> {
        Ok(self.retries)
    }

    fn pin_verified(&mut self) -> bool {
        self.verified
    }

    fn verify_pin(&mut self, pin: &[u8]) -> Result<(), PivError> {
        self.counters.verify_pin.fetch_add(1, Ordering::SeqCst);
        if pin == self.pin.as_bytes() {
            self.verified = true;
            self.retries = 3;
            Ok(())
        } else {
            self.retries = self.retries.saturating_sub(1);
            Err(PivError::Device(format!(
                "verify PIN failed: {} tries remaining",
                self.retries
            )))
        }
    }

    fn sign(
        &mut self,
        slot: Slot,
        algorithm: KeyAlgorithm,
        input: &[u8],
    ) -> Result<Vec<u8>, PivError> {
        self.counters.sign.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.sign_delay.is_zero() {
            std::thread::sleep(self.sign_delay);
        }
        self.counters.active.fetch_sub(1, Ordering::SeqCst);

        if input.len() != algorithm.input_len() {
            return Err(PivError::Device(format!(
                "input of {} bytes for {algorithm:?}",
                input.len()
            )));
        }
        let mut out = slot.id().as_bytes().to_vec();
        out.extend_from_slice(input);
        Ok(out)
    }
}

/// Hands out clones of pre-configured cards by reader name.
#[derive(Debug, Default)]
pub struct FakeOpener {
    cards: Mutex<Vec<(String, FakeCard)>>,
    opens: Arc<AtomicUsize>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_card(self, name: &str, card: FakeCard) -> Self {
        if let Ok(mut cards) = self.cards.lock() {
            cards.push((name.to_string(), card));
        }
        self
    }

    /// Counter of successful `open` calls.
    pub fn opens(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }
}

impl CardOpener for FakeOpener {
    fn cards(&self) -> Result<Vec<String>, PivError> {
        let cards = self.cards.lock().map_err(|_| PivError::Poisoned)?;
        Ok(cards.iter().map(|(name, _)| name.clone()).collect())
    }

    fn open(&self, card: &str) -> Result<Box<dyn PivDevice>, PivError> {
        let cards = self.cards.lock().map_err(|_| PivError::Poisoned)?;
        let (_, found) = cards
            .iter()
            .find(|(name, _)| name == card)
            .ok_or(PivError::NoDevice)?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(found.clone()))
    }
}
