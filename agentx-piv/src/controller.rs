//! Active-slot state machine over a single hardware token.
//!
//! All mutation and all device I/O happen under one lock, so concurrent
//! requests are serialized and never see a half-switched slot.

use std::sync::{Arc, Mutex, MutexGuard};

use agentx_core::PinPrompt;
use tracing::{debug, info, warn};

use crate::device::PivDevice;
use crate::error::PivError;
use crate::registry::{CardRegistry, SharedCard};
use crate::signer::SlotSigner;
use crate::slot::{DEFAULT_SLOT, Slot};

/// Observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerState {
    /// No slot chosen yet; the default slot is used on first use.
    Uninitialized,
    /// A slot is chosen but its signer is not built.
    SlotSelected,
    /// Signer for the active slot is cached.
    Ready,
}

#[derive(Debug, Default)]
struct SlotState {
    active: Option<Slot>,
    signer: Option<SlotSigner>,
}

pub struct HardwareSigner {
    registry: Arc<CardRegistry>,
    card_name: String,
    card: SharedCard,
    serial: u32,
    prompt: Arc<dyn PinPrompt>,
    state: Mutex<SlotState>,
}

impl HardwareSigner {
    /// Open the first available token.
    pub fn open(registry: Arc<CardRegistry>, prompt: Arc<dyn PinPrompt>) -> Result<Self, PivError> {
        let (card_name, card) = registry.open_first()?;
        let serial = card.lock().map_err(|_| PivError::Poisoned)?.serial()?;
        info!(serial, card = %card_name, "hardware token opened");
        Ok(Self {
            registry,
            card_name,
            card,
            serial,
            prompt,
            state: Mutex::new(SlotState::default()),
        })
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Id of the active slot, or the default slot when none is chosen.
    pub fn active_slot(&self) -> Result<&'static str, PivError> {
        Ok(self
            .lock_state()?
            .active
            .map(|s| s.id())
            .unwrap_or(DEFAULT_SLOT))
    }

    pub fn state(&self) -> Result<SignerState, PivError> {
        let state = self.lock_state()?;
        Ok(match (&state.active, &state.signer) {
            (None, _) => SignerState::Uninitialized,
            (Some(_), None) => SignerState::SlotSelected,
            (Some(_), Some(_)) => SignerState::Ready,
        })
    }

    /// Switch the active slot. An empty id selects the default slot.
    ///
    /// Re-selecting the active slot is a no-op. Otherwise the signer is
    /// rebuilt eagerly; if that fails the slot stays selected and the build
    /// is retried on next use.
    pub fn set_slot(&self, slot_id: &str) -> Result<(), PivError> {
        let id = if slot_id.is_empty() {
            DEFAULT_SLOT
        } else {
            slot_id
        };

        let mut state = self.lock_state()?;
        if state.active.is_some_and(|active| active.id() == id) {
            debug!(slot = id, "slot already active");
            return Ok(());
        }

        let slot = Slot::lookup(id)?;
        state.active = Some(slot);
        state.signer = None;
        info!(slot = %slot, serial = self.serial, "active slot changed");

        let mut card = self.lock_card()?;
        match SlotSigner::build(&mut **card, slot) {
            Ok(signer) => {
                state.signer = Some(signer);
                Ok(())
            }
            Err(e) => {
                warn!(slot = %slot, error = %e, "could not prepare signer for slot");
                Err(e)
            }
        }
    }

    /// DER SubjectPublicKeyInfo of the active slot's key.
    pub fn public_key(&self) -> Result<Vec<u8>, PivError> {
        let mut state = self.lock_state()?;
        let mut card = self.lock_card()?;
        let signer = ensure_signer(&mut state, &mut **card)?;
        Ok(signer.certificate().public_key_der().to_vec())
    }

    /// Sign a SHA-256 digest with the active slot.
    pub fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, PivError> {
        let mut state = self.lock_state()?;
        let mut card = self.lock_card()?;
        let signer = ensure_signer(&mut state, &mut **card)?;
        let slot = signer.slot();
        let signature = signer.sign(&mut **card, self.prompt.as_ref(), self.serial, digest)?;
        debug!(slot = %slot, len = signature.len(), "hardware signature produced");
        Ok(signature)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, SlotState>, PivError> {
        self.state.lock().map_err(|_| PivError::Poisoned)
    }

    fn lock_card(&self) -> Result<MutexGuard<'_, Box<dyn PivDevice>>, PivError> {
        self.card.lock().map_err(|_| PivError::Poisoned)
    }
}

fn ensure_signer<'a>(
    state: &'a mut SlotState,
    device: &mut dyn PivDevice,
) -> Result<&'a SlotSigner, PivError> {
    let slot = *state.active.get_or_insert_with(Slot::default_slot);
    if state.signer.is_none() {
        state.signer = Some(SlotSigner::build(device, slot)?);
    }
    state
        .signer
        .as_ref()
        .ok_or_else(|| PivError::Certificate("signer unavailable".into()))
}

impl Drop for HardwareSigner {
    fn drop(&mut self) {
        if self.registry.release(&self.card_name) {
            debug!(card = %self.card_name, "hardware token released");
        }
    }
}

impl std::fmt::Debug for HardwareSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareSigner")
            .field("card", &self.card_name)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use agentx_core::{PinRequest, PromptError};
    use zeroize::Zeroizing;

    use super::*;
    use crate::fake::{
        FakeCard, FakeCounters, FakeOpener, P256_NEVER_ATTESTATION, P256_SPKI, RSA_SPKI,
        RSA_STORED_CERT,
    };

    struct CountingPin(Arc<std::sync::atomic::AtomicUsize>);

    impl PinPrompt for CountingPin {
        fn request_pin(&self, req: &PinRequest) -> Result<Zeroizing<String>, PromptError> {
            assert_eq!(req.serial, 4242);
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Zeroizing::new("123456".into()))
        }
    }

    fn card() -> FakeCard {
        FakeCard::new(4242)
            .with_attestation("9a", P256_NEVER_ATTESTATION)
            .with_certificate("9c", RSA_STORED_CERT)
    }

    fn signer_for(card: FakeCard) -> (HardwareSigner, FakeCounters, Arc<CardRegistry>) {
        let counters = card.counters();
        let registry = Arc::new(CardRegistry::new(FakeOpener::new().with_card("reader 0", card)));
        let prompts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let signer =
            HardwareSigner::open(Arc::clone(&registry), Arc::new(CountingPin(prompts))).unwrap();
        (signer, counters, registry)
    }

    #[test]
    fn open_without_token_fails() {
        let registry = Arc::new(CardRegistry::new(FakeOpener::new()));
        let prompts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let err = HardwareSigner::open(registry, Arc::new(CountingPin(prompts))).unwrap_err();
        assert!(matches!(err, PivError::NoDevice));
    }

    #[test]
    fn starts_uninitialized_on_default_slot() {
        let (signer, counters, _) = signer_for(card());
        assert_eq!(signer.serial(), 4242);
        assert_eq!(signer.state().unwrap(), SignerState::Uninitialized);
        assert_eq!(signer.active_slot().unwrap(), "9a");
        assert_eq!(counters.attest.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn public_key_builds_default_signer_lazily() {
        let (signer, counters, _) = signer_for(card());
        assert_eq!(signer.public_key().unwrap(), P256_SPKI);
        assert_eq!(signer.state().unwrap(), SignerState::Ready);
        assert_eq!(signer.public_key().unwrap(), P256_SPKI);
        assert_eq!(counters.attest.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_slot_twice_builds_once() {
        let (signer, counters, _) = signer_for(card());
        signer.set_slot("9c").unwrap();
        signer.set_slot("9c").unwrap();
        assert_eq!(signer.active_slot().unwrap(), "9c");
        assert_eq!(signer.state().unwrap(), SignerState::Ready);
        assert_eq!(counters.attest.load(Ordering::SeqCst), 1);
        assert_eq!(counters.certificate.load(Ordering::SeqCst), 1);
        assert_eq!(signer.public_key().unwrap(), RSA_SPKI);
    }

    #[test]
    fn empty_slot_id_means_default() {
        let (signer, counters, _) = signer_for(card());
        signer.set_slot("").unwrap();
        assert_eq!(signer.active_slot().unwrap(), "9a");
        signer.set_slot("9a").unwrap();
        assert_eq!(counters.attest.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_slot_leaves_state_alone() {
        let (signer, _, _) = signer_for(card());
        signer.set_slot("9c").unwrap();
        let err = signer.set_slot("zz").unwrap_err();
        assert!(matches!(err, PivError::UnknownSlot(ref s) if s == "zz"));
        assert_eq!(signer.active_slot().unwrap(), "9c");
        assert_eq!(signer.state().unwrap(), SignerState::Ready);
    }

    #[test]
    fn failed_build_keeps_slot_selected() {
        let (signer, counters, _) = signer_for(card());
        assert!(signer.set_slot("9d").is_err());
        assert_eq!(signer.state().unwrap(), SignerState::SlotSelected);
        assert_eq!(signer.active_slot().unwrap(), "9d");
        // Same slot again is a no-op, the next sign retries the build.
        signer.set_slot("9d").unwrap();
        assert!(signer.sign(&[0u8; 32]).is_err());
        assert_eq!(counters.attest.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sign_uses_active_slot() {
        let (signer, _, _) = signer_for(card());
        let digest = [9u8; 32];
        let sig = signer.sign(&digest).unwrap();
        assert_eq!(&sig[..2], b"9a");
        assert_eq!(&sig[2..], &digest);

        signer.set_slot("9c").unwrap();
        let sig = signer.sign(&digest).unwrap();
        assert_eq!(&sig[..2], b"9c");
        assert_eq!(sig.len(), 2 + 256);
    }

    #[test]
    fn concurrent_signs_never_overlap() {
        let card = card().with_sign_delay(Duration::from_millis(20));
        let (signer, counters, _) = signer_for(card);
        let signer = Arc::new(signer);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let signer = Arc::clone(&signer);
                thread::spawn(move || {
                    if i % 3 == 0 {
                        signer.set_slot(if i % 2 == 0 { "9a" } else { "9c" }).unwrap();
                    }
                    signer.sign(&[i as u8; 32]).unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counters.sign.load(Ordering::SeqCst), 8);
        assert_eq!(counters.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_card() {
        let (signer, _, registry) = signer_for(card());
        assert!(registry.is_open("reader 0"));
        drop(signer);
        assert!(!registry.is_open("reader 0"));
    }

    #[test]
    fn pin_prompted_once_per_card_handle() {
        let card = FakeCard::new(4242).with_certificate("9c", RSA_STORED_CERT);
        let registry = Arc::new(CardRegistry::new(FakeOpener::new().with_card("r", card)));
        let prompts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let signer =
            HardwareSigner::open(registry, Arc::new(CountingPin(Arc::clone(&prompts)))).unwrap();
        signer.set_slot("9c").unwrap();
        signer.sign(&[1u8; 32]).unwrap();
        signer.sign(&[2u8; 32]).unwrap();
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }
}
