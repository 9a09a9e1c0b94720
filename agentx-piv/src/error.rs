//! Error types for PIV token access.

use agentx_core::PromptError;

#[derive(Debug, thiserror::Error)]
pub enum PivError {
    #[error("error detecting yubikey: try removing and reconnecting the device")]
    NoDevice,

    #[error("unsupported slot-id '{0}'")]
    UnknownSlot(String),

    /// Anything reported by the token itself.  Never retried: the token keeps
    /// its own PIN retry counter.
    #[error("device error: {0}")]
    Device(String),

    #[error("PIN prompt failed: {0}")]
    PinPrompt(#[from] PromptError),

    #[error("expected a {expected}-byte SHA-256 digest, got {actual} bytes")]
    InvalidDigest { expected: usize, actual: usize },

    #[error("unsupported key in slot: {0}")]
    UnsupportedKey(String),

    #[error("error retrieving public key: {0}")]
    Certificate(String),

    #[error("hardware signer lock poisoned")]
    Poisoned,
}
