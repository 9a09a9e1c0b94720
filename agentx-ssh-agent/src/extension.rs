//! Name-keyed routing of `SSH_AGENTC_EXTENSION` requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

/// Detached OpenPGP signature by a derived identity.
pub const GPG_SIGN: &str = "ssh-gpg-sign@42wim";
/// Hardware signature over a SHA-256 digest with the active PIV slot.
pub const YUBI_SIGN: &str = "ssh-yubi-sign@42wim";
/// DER public key of the active PIV slot.
pub const YUBI_PUBLIC_KEY: &str = "ssh-yubi-publickey@42wim";
/// Switch the active PIV slot.
pub const YUBI_SET_SLOT: &str = "ssh-yubi-setslot@42wim";

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    /// No handler registered under the requested name.
    #[error("agent: extension unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl ExtensionError {
    pub fn failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ExtensionError::Failed(err.into())
    }
}

pub trait ExtensionHandler: Send + Sync {
    /// Handle one request.  An empty result is acknowledged with
    /// `SSH_AGENT_SUCCESS`.
    fn handle(&self, payload: &[u8]) -> Result<Vec<u8>, ExtensionError>;
}

impl<F> ExtensionHandler for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, ExtensionError> + Send + Sync,
{
    fn handle(&self, payload: &[u8]) -> Result<Vec<u8>, ExtensionError> {
        self(payload)
    }
}

#[derive(Default)]
pub struct ExtensionRegistry {
    handlers: HashMap<String, Arc<dyn ExtensionHandler>>,
    verbose: AtomicBool,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register(&mut self, name: impl Into<String>, handler: impl ExtensionHandler + 'static) {
        let name = name.into();
        debug!(extension = %name, "extension registered");
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Log every request at `info` instead of `debug`.
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn handle(&self, name: &str, payload: &[u8]) -> Result<Vec<u8>, ExtensionError> {
        if self.is_verbose() {
            info!(extension = name, payload_len = payload.len(), "extension request");
        } else {
            debug!(extension = name, payload_len = payload.len(), "extension request");
        }
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| ExtensionError::Unsupported(name.to_string()))?;
        handler.handle(payload)
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("handlers", &self.names())
            .field("verbose", &self.is_verbose())
            .finish()
    }
}
