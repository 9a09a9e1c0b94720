//! In-memory key ring backing the standard agent requests.
//!
//! Keys live only in memory and are zeroized on drop by `ssh_key`.  A locked
//! ring lists nothing and refuses every mutation or signature until unlocked
//! with the same passphrase.
//!
//! RSA keys sign with SHA-2 only.  A sign request without an
//! `rsa-sha2-*` flag gets `rsa-sha2-512`, where OpenSSH's own agent would
//! fall back to a SHA-1 `ssh-rsa` signature; clients that still verify
//! `ssh-rsa` only will reject it.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use rsa::BigUint;
use rsa::pkcs1v15::SigningKey;
use sha2::{Sha256, Sha512};
use signature::{SignatureEncoding as _, Signer as _};
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::public::KeyData;
use ssh_key::{Algorithm, HashAlg, Mpint, PrivateKey, Signature};
use subtle::ConstantTimeEq as _;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// `SSH_AGENT_RSA_SHA2_256` sign-request flag.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
/// `SSH_AGENT_RSA_SHA2_512` sign-request flag.
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

#[derive(Debug, thiserror::Error)]
pub enum KeyRingError {
    #[error("agent: locked")]
    Locked,

    #[error("agent: not locked")]
    NotLocked,

    #[error("agent: already locked")]
    AlreadyLocked,

    #[error("agent: incorrect passphrase")]
    BadPassphrase,

    #[error("agent: key not found")]
    NotFound,

    #[error("agent: unsupported credential: {0}")]
    UnsupportedCredential(String),

    #[error("agent: signing failed: {0}")]
    Sign(String),

    #[error("key ring lock poisoned")]
    Poisoned,
}

/// Constraints attached by `ssh-add -t` / `ssh-add -c`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyConstraints {
    pub lifetime: Option<Duration>,
    pub confirm: bool,
}

/// A listed key: public half plus comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySummary {
    pub public_key: KeyData,
    pub comment: String,
}

struct KeyEntry {
    private_key: PrivateKey,
    expires_at: Option<Instant>,
    confirm: bool,
}

impl KeyEntry {
    fn public(&self) -> &KeyData {
        self.private_key.public_key().key_data()
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("fingerprint", &self.private_key.fingerprint(HashAlg::Sha256))
            .field("comment", &self.private_key.comment())
            .field("expires_at", &self.expires_at)
            .field("confirm", &self.confirm)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct KeyRing {
    keys: Vec<KeyEntry>,
    passphrase: Option<Zeroizing<Vec<u8>>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Add a key, replacing any entry with the same public key.
    pub fn add(
        &mut self,
        private_key: PrivateKey,
        constraints: KeyConstraints,
        now: Instant,
    ) -> Result<(), KeyRingError> {
        if self.is_locked() {
            return Err(KeyRingError::Locked);
        }
        let entry = KeyEntry {
            expires_at: constraints.lifetime.map(|d| now + d),
            confirm: constraints.confirm,
            private_key,
        };
        debug!(
            fingerprint = %entry.private_key.fingerprint(HashAlg::Sha256),
            comment = entry.private_key.comment(),
            lifetime = ?constraints.lifetime,
            "keyring: adding key"
        );
        match self.keys.iter_mut().find(|k| k.public() == entry.public()) {
            Some(existing) => *existing = entry,
            None => self.keys.push(entry),
        }
        Ok(())
    }

    pub fn remove(&mut self, public_key: &KeyData) -> Result<(), KeyRingError> {
        if self.is_locked() {
            return Err(KeyRingError::Locked);
        }
        let before = self.keys.len();
        self.keys.retain(|k| k.public() != public_key);
        if self.keys.len() == before {
            return Err(KeyRingError::NotFound);
        }
        Ok(())
    }

    /// Remove every key, returning how many were held.
    pub fn remove_all(&mut self) -> Result<usize, KeyRingError> {
        if self.is_locked() {
            return Err(KeyRingError::Locked);
        }
        let removed = self.keys.len();
        self.keys.clear();
        Ok(removed)
    }

    /// Live keys in insertion order; empty while locked.
    pub fn list(&self, now: Instant) -> Vec<KeySummary> {
        if self.is_locked() {
            return Vec::new();
        }
        self.keys
            .iter()
            .filter(|k| k.is_live(now))
            .map(|k| KeySummary {
                public_key: k.public().clone(),
                comment: k.private_key.comment().to_string(),
            })
            .collect()
    }

    pub fn sign(
        &self,
        public_key: &KeyData,
        data: &[u8],
        flags: u32,
        now: Instant,
    ) -> Result<Signature, KeyRingError> {
        if self.is_locked() {
            return Err(KeyRingError::Locked);
        }
        let entry = self
            .keys
            .iter()
            .find(|k| k.public() == public_key && k.is_live(now))
            .ok_or(KeyRingError::NotFound)?;

        if entry.confirm {
            warn!(
                fingerprint = %entry.private_key.fingerprint(HashAlg::Sha256),
                "sign request for key added with confirm constraint (confirmation not supported, allowing)"
            );
        }

        match entry.private_key.key_data() {
            KeypairData::Rsa(keypair) => sign_rsa(keypair, data, flags),
            _ => entry
                .private_key
                .try_sign(data)
                .map_err(|e| KeyRingError::Sign(e.to_string())),
        }
    }

    pub fn lock(&mut self, passphrase: &[u8]) -> Result<(), KeyRingError> {
        if self.is_locked() {
            return Err(KeyRingError::AlreadyLocked);
        }
        self.passphrase = Some(Zeroizing::new(passphrase.to_vec()));
        debug!("keyring locked");
        Ok(())
    }

    pub fn unlock(&mut self, passphrase: &[u8]) -> Result<(), KeyRingError> {
        let stored = self.passphrase.as_ref().ok_or(KeyRingError::NotLocked)?;
        if !bool::from(stored.as_slice().ct_eq(passphrase)) {
            return Err(KeyRingError::BadPassphrase);
        }
        self.passphrase = None;
        debug!("keyring unlocked");
        Ok(())
    }

    /// Drop keys whose lifetime has elapsed, returning their public halves.
    pub fn expire(&mut self, now: Instant) -> Vec<KeyData> {
        let mut expired = Vec::new();
        self.keys.retain(|k| {
            if k.is_live(now) {
                true
            } else {
                expired.push(k.public().clone());
                false
            }
        });
        for key in &expired {
            debug!(fingerprint = %key.fingerprint(HashAlg::Sha256), "keyring: key lifetime elapsed");
        }
        expired
    }
}

fn positive(m: &Mpint) -> Result<BigUint, KeyRingError> {
    m.as_positive_bytes()
        .map(BigUint::from_bytes_be)
        .ok_or_else(|| KeyRingError::Sign("RSA key component is not positive".into()))
}

/// RSA signatures over SHA-2, chosen by the request flags. Requests without
/// a SHA-2 flag get SHA-512; SHA-1 `ssh-rsa` signatures are not produced.
fn sign_rsa(keypair: &RsaKeypair, data: &[u8], flags: u32) -> Result<Signature, KeyRingError> {
    let key = rsa::RsaPrivateKey::from_components(
        positive(&keypair.public.n)?,
        positive(&keypair.public.e)?,
        positive(&keypair.private.d)?,
        vec![positive(&keypair.private.p)?, positive(&keypair.private.q)?],
    )
    .map_err(|e| KeyRingError::Sign(e.to_string()))?;

    let (hash, bytes) = if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
        let sig = SigningKey::<Sha256>::new(key)
            .try_sign(data)
            .map_err(|e| KeyRingError::Sign(e.to_string()))?;
        (HashAlg::Sha256, sig.to_bytes().into_vec())
    } else {
        let sig = SigningKey::<Sha512>::new(key)
            .try_sign(data)
            .map_err(|e| KeyRingError::Sign(e.to_string()))?;
        (HashAlg::Sha512, sig.to_bytes().into_vec())
    };

    Signature::new(Algorithm::Rsa { hash: Some(hash) }, bytes)
        .map_err(|e| KeyRingError::Sign(e.to_string()))
}

/// Base-agent operations the session delegates to.
pub trait KeyAgent: Send + Sync {
    fn add(&self, private_key: PrivateKey, constraints: KeyConstraints)
    -> Result<(), KeyRingError>;
    fn remove(&self, public_key: &KeyData) -> Result<(), KeyRingError>;
    fn remove_all(&self) -> Result<usize, KeyRingError>;
    fn list(&self) -> Result<Vec<KeySummary>, KeyRingError>;
    fn sign(&self, public_key: &KeyData, data: &[u8], flags: u32)
    -> Result<Signature, KeyRingError>;
    fn lock(&self, passphrase: &[u8]) -> Result<(), KeyRingError>;
    fn unlock(&self, passphrase: &[u8]) -> Result<(), KeyRingError>;
    /// Remove keys whose lifetime elapsed and report them.
    fn expire(&self) -> Result<Vec<KeyData>, KeyRingError>;
}

impl KeyAgent for RwLock<KeyRing> {
    fn add(
        &self,
        private_key: PrivateKey,
        constraints: KeyConstraints,
    ) -> Result<(), KeyRingError> {
        self.write()
            .map_err(|_| KeyRingError::Poisoned)?
            .add(private_key, constraints, Instant::now())
    }

    fn remove(&self, public_key: &KeyData) -> Result<(), KeyRingError> {
        self.write()
            .map_err(|_| KeyRingError::Poisoned)?
            .remove(public_key)
    }

    fn remove_all(&self) -> Result<usize, KeyRingError> {
        self.write().map_err(|_| KeyRingError::Poisoned)?.remove_all()
    }

    fn list(&self) -> Result<Vec<KeySummary>, KeyRingError> {
        Ok(self
            .read()
            .map_err(|_| KeyRingError::Poisoned)?
            .list(Instant::now()))
    }

    fn sign(
        &self,
        public_key: &KeyData,
        data: &[u8],
        flags: u32,
    ) -> Result<Signature, KeyRingError> {
        self.read()
            .map_err(|_| KeyRingError::Poisoned)?
            .sign(public_key, data, flags, Instant::now())
    }

    fn lock(&self, passphrase: &[u8]) -> Result<(), KeyRingError> {
        self.write()
            .map_err(|_| KeyRingError::Poisoned)?
            .lock(passphrase)
    }

    fn unlock(&self, passphrase: &[u8]) -> Result<(), KeyRingError> {
        self.write()
            .map_err(|_| KeyRingError::Poisoned)?
            .unlock(passphrase)
    }

    fn expire(&self) -> Result<Vec<KeyData>, KeyRingError> {
        Ok(self
            .write()
            .map_err(|_| KeyRingError::Poisoned)?
            .expire(Instant::now()))
    }
}
