//! PIV hardware token signing for ssh-agentx.
//!
//! [`HardwareSigner`] owns the active-slot state for one token and serializes
//! every device transaction.  The token itself sits behind the [`PivDevice`]
//! port; the PC/SC adapter is built with the `yubikey` feature, and an
//! in-memory card is available under the `testing` feature.

pub mod cert;
pub mod controller;
pub mod device;
pub mod error;
pub mod registry;
pub mod signer;
pub mod slot;

#[cfg(any(test, feature = "testing"))]
pub mod fake;
#[cfg(feature = "yubikey")]
pub mod pcsc;

pub use cert::{PinPolicy, SlotCertificate};
pub use controller::{HardwareSigner, SignerState};
pub use device::{CardOpener, KeyAlgorithm, PivDevice};
pub use error::PivError;
pub use registry::{CardRegistry, SharedCard};
pub use signer::{DIGEST_LEN, SlotSigner, signature_input};
pub use slot::{DEFAULT_SLOT, Slot};
