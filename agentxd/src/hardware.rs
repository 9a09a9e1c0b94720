//! Hardware signer startup.

use std::sync::Arc;

use agentx_core::{Pinentry, YubiKeyConfig};
use agentx_piv::{CardRegistry, HardwareSigner, PivError};
use anyhow::{Context as _, Result};
use tracing::{info, warn};

#[cfg(feature = "yubikey")]
fn card_registry() -> Result<Arc<CardRegistry>> {
    Ok(Arc::new(CardRegistry::new(agentx_piv::pcsc::YubiKeyOpener)))
}

#[cfg(not(feature = "yubikey"))]
fn card_registry() -> Result<Arc<CardRegistry>> {
    anyhow::bail!(
        "yubikey.enable is set but ssh-agentx was built without YubiKey support (rebuild with --features yubikey)"
    )
}

/// Open the first token and select the configured slot.
pub fn start(config: &YubiKeyConfig) -> Result<Arc<HardwareSigner>> {
    start_with(card_registry()?, config)
}

/// A missing token or an unknown default slot is fatal.  A slot whose key
/// cannot be read yet only warns: the signer is rebuilt on first use.
pub fn start_with(cards: Arc<CardRegistry>, config: &YubiKeyConfig) -> Result<Arc<HardwareSigner>> {
    let pinentry = Pinentry::discover(config.pinentry.as_deref(), config.pindescription.clone());
    info!(program = %pinentry.program().display(), "using pinentry");

    let signer = HardwareSigner::open(cards, Arc::new(pinentry))
        .context("yubikey.enable is set but no token was found")?;

    if config.enablelog {
        info!(slot = %config.defaultslot, "setting slot");
    }
    match signer.set_slot(&config.defaultslot) {
        Ok(()) => {}
        Err(e @ PivError::UnknownSlot(_)) => {
            return Err(e).context("invalid yubikey.defaultslot");
        }
        Err(e) => {
            warn!(error = %e, "hardware signer not ready, will retry on first use");
        }
    }
    info!(
        serial = signer.serial(),
        slot = signer.active_slot().unwrap_or_default(),
        "hardware signing enabled"
    );
    Ok(Arc::new(signer))
}
