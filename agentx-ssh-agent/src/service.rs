//! Agent request handling: standard requests go to the key ring, with
//! add/remove/remove-all reported to observers once they succeed.
//!
//! A key-ring change and its observer notification happen under one
//! service-wide lock, so observers never hold state for a key that another
//! connection already removed.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ssh_agent_lib::agent::Session;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Credential, Identity, KeyConstraint, RemoveIdentity,
    SignRequest,
};
use ssh_key::public::KeyData;
use ssh_key::{HashAlg, PrivateKey, Signature};
use tracing::{debug, warn};

use crate::extension::{ExtensionError, ExtensionRegistry};
use crate::keyring::{KeyAgent, KeyConstraints, KeyRingError};

/// Notified after the key ring accepted a change.
pub trait KeyObserver: Send + Sync {
    fn key_added(&self, private_key: &PrivateKey);
    fn key_removed(&self, public_key: &KeyData);
    fn all_removed(&self);
}

fn other_err(msg: impl Into<String>) -> AgentError {
    AgentError::other(io::Error::other(msg.into()))
}

fn ring_err(e: KeyRingError) -> AgentError {
    AgentError::other(e)
}

/// Shared by every connection; cloning is cheap.
#[derive(Clone)]
pub struct AgentService {
    keys: Arc<dyn KeyAgent>,
    observers: Vec<Arc<dyn KeyObserver>>,
    extensions: Arc<ExtensionRegistry>,
    // Held across a key-ring change and its notifications.
    changes: Arc<Mutex<()>>,
}

impl AgentService {
    pub fn new(keys: Arc<dyn KeyAgent>, extensions: Arc<ExtensionRegistry>) -> Self {
        Self {
            keys,
            observers: Vec::new(),
            extensions,
            changes: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn KeyObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    /// Run an extension handler on the blocking pool; handlers may talk to
    /// hardware or wait for a PIN prompt.
    pub async fn handle_extension(
        &self,
        name: String,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ExtensionError> {
        let extensions = Arc::clone(&self.extensions);
        tokio::task::spawn_blocking(move || extensions.handle(&name, &payload))
            .await
            .map_err(ExtensionError::failed)?
    }

    fn change_lock(&self) -> Result<MutexGuard<'_, ()>, KeyRingError> {
        self.changes.lock().map_err(|_| KeyRingError::Poisoned)
    }

    fn expire(&self) {
        let _changes = match self.change_lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "could not expire keys");
                return;
            }
        };
        match self.keys.expire() {
            Ok(expired) => {
                for key in &expired {
                    for observer in &self.observers {
                        observer.key_removed(key);
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not expire keys"),
        }
    }

    fn add(&self, identity: AddIdentity, constraints: KeyConstraints) -> Result<(), AgentError> {
        let (privkey, comment) = match identity.credential {
            Credential::Key { privkey, comment } => (privkey, comment),
            Credential::Cert { .. } => {
                return Err(ring_err(KeyRingError::UnsupportedCredential(
                    "certificates".into(),
                )));
            }
        };
        let private_key = PrivateKey::new(privkey, comment)
            .map_err(|e| other_err(format!("invalid key: {e}")))?;

        let _changes = self.change_lock().map_err(ring_err)?;
        self.keys
            .add(private_key.clone(), constraints)
            .map_err(ring_err)?;
        debug!(
            fingerprint = %private_key.fingerprint(HashAlg::Sha256),
            comment = private_key.comment(),
            "add_identity"
        );
        for observer in &self.observers {
            observer.key_added(&private_key);
        }
        Ok(())
    }
}

impl std::fmt::Debug for AgentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentService")
            .field("observers", &self.observers.len())
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

#[ssh_agent_lib::async_trait]
impl Session for AgentService {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        self.expire();
        let identities: Vec<Identity> = self
            .keys
            .list()
            .map_err(ring_err)?
            .into_iter()
            .map(|k| Identity {
                pubkey: k.public_key,
                comment: k.comment,
            })
            .collect();
        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        self.expire();
        debug!(
            fingerprint = %request.pubkey.fingerprint(HashAlg::Sha256),
            data_len = request.data.len(),
            flags = request.flags,
            "sign"
        );
        self.keys
            .sign(&request.pubkey, &request.data, request.flags)
            .map_err(ring_err)
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        self.add(identity, KeyConstraints::default())
    }

    async fn add_identity_constrained(
        &mut self,
        identity: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        let mut constraints = KeyConstraints::default();
        for constraint in &identity.constraints {
            match constraint {
                KeyConstraint::Lifetime(secs) => {
                    constraints.lifetime = Some(Duration::from_secs(u64::from(*secs)));
                }
                KeyConstraint::Confirm => constraints.confirm = true,
                _ => return Err(other_err("unsupported key constraint")),
            }
        }
        self.add(identity.identity, constraints)
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        let _changes = self.change_lock().map_err(ring_err)?;
        self.keys.remove(&identity.pubkey).map_err(ring_err)?;
        debug!(fingerprint = %identity.pubkey.fingerprint(HashAlg::Sha256), "remove_identity");
        for observer in &self.observers {
            observer.key_removed(&identity.pubkey);
        }
        Ok(())
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        let _changes = self.change_lock().map_err(ring_err)?;
        let removed = self.keys.remove_all().map_err(ring_err)?;
        debug!(removed, "remove_all_identities");
        for observer in &self.observers {
            observer.all_removed();
        }
        Ok(())
    }

    async fn lock(&mut self, key: String) -> Result<(), AgentError> {
        self.keys.lock(key.as_bytes()).map_err(ring_err)
    }

    async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
        self.keys.unlock(key.as_bytes()).map_err(ring_err)
    }
}
