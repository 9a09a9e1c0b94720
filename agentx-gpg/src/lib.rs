//! OpenPGP signing with identities derived from SSH keys.
//!
//! When an SSH key whose comment matches a configured rule is added to the
//! agent, [`IdentityManager`] derives a self-certified OpenPGP key from the
//! same key material.  Clients then ask for detached signatures through the
//! `gpg-sign` agent extension, e.g. for `git commit -S` without a separate
//! GnuPG keyring.

pub mod error;
pub mod identity;
pub mod manager;

pub use error::GpgError;
pub use identity::SigningIdentity;
pub use manager::{IdentityManager, USER_ID_FIELD_LEN};
