//! Shared pieces of ssh-agentx: the TOML configuration model and the PIN
//! prompt used by the hardware signer.

pub mod config;
pub mod pinentry;
pub mod prompt;

pub use config::{Config, ConfigError, IdentityRule, YubiKeyConfig};
pub use pinentry::Pinentry;
pub use prompt::{PinPrompt, PinRequest, PromptError};
