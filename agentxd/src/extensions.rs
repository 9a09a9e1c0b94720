//! Wiring between the agent and the two signing backends.

use std::sync::Arc;

use agentx_gpg::IdentityManager;
use agentx_piv::HardwareSigner;
use agentx_ssh_agent::extension::{GPG_SIGN, YUBI_PUBLIC_KEY, YUBI_SET_SLOT, YUBI_SIGN};
use agentx_ssh_agent::{ExtensionError, ExtensionRegistry, KeyObserver};
use ssh_key::public::KeyData;
use ssh_key::{HashAlg, PrivateKey};
use tracing::{info, warn};

/// Keeps derived OpenPGP identities in step with the key ring.  Derivation
/// failures are logged; they never fail the SSH request.
pub struct GpgObserver(Arc<IdentityManager>);

impl GpgObserver {
    pub fn new(gpg: Arc<IdentityManager>) -> Self {
        Self(gpg)
    }
}

impl KeyObserver for GpgObserver {
    fn key_added(&self, private_key: &PrivateKey) {
        match self.0.on_key_added(private_key) {
            Ok(0) => {}
            Ok(derived) => info!(
                comment = private_key.comment(),
                derived,
                "derived OpenPGP identity from SSH key"
            ),
            Err(e) => warn!(
                fingerprint = %private_key.fingerprint(HashAlg::Sha256),
                comment = private_key.comment(),
                error = %e,
                "could not derive OpenPGP identity"
            ),
        }
    }

    fn key_removed(&self, public_key: &KeyData) {
        if let Err(e) = self.0.on_key_removed(public_key) {
            warn!(error = %e, "could not drop OpenPGP identities for removed key");
        }
    }

    fn all_removed(&self) {
        if let Err(e) = self.0.on_remove_all() {
            warn!(error = %e, "could not clear OpenPGP identities");
        }
    }
}

pub fn register_gpg(registry: &mut ExtensionRegistry, gpg: Arc<IdentityManager>) {
    registry.register(GPG_SIGN, move |payload: &[u8]| -> Result<Vec<u8>, ExtensionError> {
        gpg.sign(payload).map_err(ExtensionError::failed)
    });
}

pub fn register_hardware(registry: &mut ExtensionRegistry, hardware: Arc<HardwareSigner>) {
    let signer = Arc::clone(&hardware);
    registry.register(YUBI_SIGN, move |digest: &[u8]| -> Result<Vec<u8>, ExtensionError> {
        signer.sign(digest).map_err(ExtensionError::failed)
    });

    let signer = Arc::clone(&hardware);
    registry.register(YUBI_PUBLIC_KEY, move |_: &[u8]| -> Result<Vec<u8>, ExtensionError> {
        signer.public_key().map_err(ExtensionError::failed)
    });

    registry.register(YUBI_SET_SLOT, move |payload: &[u8]| -> Result<Vec<u8>, ExtensionError> {
        let slot = std::str::from_utf8(payload).map_err(ExtensionError::failed)?;
        hardware.set_slot(slot).map_err(ExtensionError::failed)?;
        Ok(Vec::new())
    });
}
