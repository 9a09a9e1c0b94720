//! Lifecycle of derived identities alongside the SSH key ring.
//!
//! The manager mirrors key-ring events: an added key that matches one or
//! more identity rules gains one derived identity per rule, a removed key
//! loses them, and remove-all clears the set.  Every access to the identity
//! set goes through a single `RwLock`, so `gpg-sign` lookups never observe a
//! half-applied add or remove.

use std::sync::{PoisonError, RwLock};

use agentx_core::IdentityRule;
use ssh_key::PrivateKey;
use ssh_key::public::KeyData;
use tracing::{debug, info, warn};

use crate::error::GpgError;
use crate::identity::{SigningIdentity, wire_encoding};

/// Length of the NUL-terminated user-ID field at the start of a `gpg-sign`
/// payload.  The data to sign starts right after it.
pub const USER_ID_FIELD_LEN: usize = 400;

#[derive(Debug, Default)]
pub struct IdentityManager {
    rules: RwLock<Vec<IdentityRule>>,
    identities: RwLock<Vec<SigningIdentity>>,
}

impl IdentityManager {
    pub fn new(rules: Vec<IdentityRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            identities: RwLock::new(Vec::new()),
        }
    }

    /// Replace the identity rules.  Already-derived identities are kept;
    /// new rules apply to keys added from now on.
    pub fn set_rules(&self, rules: Vec<IdentityRule>) -> Result<(), GpgError> {
        let mut current = self.rules.write().map_err(|_| GpgError::Poisoned)?;
        *current = rules;
        Ok(())
    }

    /// Derive an identity for every rule whose `matchcomment` equals the
    /// key's comment.  Identities previously derived from the same key are
    /// replaced.
    ///
    /// Returns the number of identities added.  When some rules fail, the
    /// successful ones are still committed and the first error is returned.
    pub fn on_key_added(&self, private_key: &PrivateKey) -> Result<usize, GpgError> {
        let comment = private_key.comment();
        let matching: Vec<IdentityRule> = self
            .rules
            .read()
            .map_err(|_| GpgError::Poisoned)?
            .iter()
            .filter(|rule| rule.matchcomment == comment)
            .cloned()
            .collect();

        if matching.is_empty() {
            debug!(comment, "no identity rule matches key comment");
            return Ok(0);
        }

        let mut derived = Vec::with_capacity(matching.len());
        let mut first_error = None;
        for rule in &matching {
            match SigningIdentity::derive(private_key, &rule.name, &rule.email) {
                Ok(identity) => {
                    info!(
                        user_id = identity.user_id(),
                        fingerprint = %identity.cert().fingerprint(),
                        "adding public key for {}",
                        identity.user_id()
                    );
                    match identity.armored_public_key() {
                        Ok(armored) => info!(
                            user_id = identity.user_id(),
                            "OpenPGP public key, import it where signatures are checked:\n{armored}"
                        ),
                        Err(e) => warn!("could not armor public key: {e}"),
                    }
                    derived.push(identity);
                }
                Err(e) => {
                    warn!(comment, error = %e, "OpenPGP derivation failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        let added = derived.len();
        if added > 0 {
            let marshaled = derived[0].ssh_public_key().to_vec();
            let mut identities = self.identities.write().map_err(|_| GpgError::Poisoned)?;
            identities.retain(|i| i.ssh_public_key() != marshaled.as_slice());
            identities.extend(derived);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(added),
        }
    }

    /// Drop every identity derived from `public_key`, compared by exact
    /// wire encoding.  Returns how many were removed.
    pub fn on_key_removed(&self, public_key: &KeyData) -> Result<usize, GpgError> {
        let marshaled = wire_encoding(public_key)?;
        let mut identities = self.identities.write().map_err(|_| GpgError::Poisoned)?;
        let before = identities.len();
        identities.retain(|i| i.ssh_public_key() != marshaled.as_slice());
        let removed = before - identities.len();
        if removed > 0 {
            debug!(removed, "removed OpenPGP identities");
        }
        Ok(removed)
    }

    pub fn on_remove_all(&self) -> Result<(), GpgError> {
        self.identities
            .write()
            .map_err(|_| GpgError::Poisoned)?
            .clear();
        Ok(())
    }

    /// Handle a `gpg-sign` payload: a NUL-terminated user ID within the first
    /// [`USER_ID_FIELD_LEN`] bytes, followed by the data to sign.  When
    /// several identities share the user ID, the most recently added wins.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, GpgError> {
        let field = &payload[..payload.len().min(USER_ID_FIELD_LEN)];
        let user_id = match field.iter().position(|&b| b == 0) {
            Some(end) => &field[..end],
            None => {
                warn!("gpg-sign payload has no NUL-terminated user id");
                return Err(GpgError::NoSignerForIdentity(
                    String::from_utf8_lossy(field).into_owned(),
                ));
            }
        };
        let data = payload.get(USER_ID_FIELD_LEN..).unwrap_or_default();

        let identities = self.identities.read().map_err(|_| GpgError::Poisoned)?;
        let Some(identity) = identities
            .iter()
            .rev()
            .find(|i| i.user_id().as_bytes() == user_id)
        else {
            let wanted = String::from_utf8_lossy(user_id).into_owned();
            warn!(user_id = %wanted, "no GPG signer found");
            return Err(GpgError::NoSignerForIdentity(wanted));
        };

        info!(user_id = identity.user_id(), len = data.len(), "signing data");
        identity.sign_detached(data)
    }

    /// User IDs in insertion order.
    pub fn user_ids(&self) -> Result<Vec<String>, GpgError> {
        Ok(self
            .identities
            .read()
            .map_err(|_| GpgError::Poisoned)?
            .iter()
            .map(|i| i.user_id().to_string())
            .collect())
    }

    /// Number of derived identities.  A poisoned lock still reports the
    /// set as it was left.
    pub fn len(&self) -> usize {
        self.identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_WORK: &str = include_str!("../testdata/ed25519_work");
    const ED25519_PERSONAL: &str = include_str!("../testdata/ed25519_personal");
    const RSA_WORK: &str = include_str!("../testdata/rsa_work");
    const ECDSA_WORK: &str = include_str!("../testdata/ecdsa_work");

    fn key(pem: &str) -> PrivateKey {
        PrivateKey::from_openssh(pem).unwrap()
    }

    fn key_with_comment(pem: &str, comment: &str) -> PrivateKey {
        let mut k = key(pem);
        k.set_comment(comment);
        k
    }

    fn rule(comment: &str, name: &str, email: &str) -> IdentityRule {
        IdentityRule {
            matchcomment: comment.to_string(),
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    fn payload(user_id: &str, data: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; USER_ID_FIELD_LEN];
        p[..user_id.len()].copy_from_slice(user_id.as_bytes());
        p.extend_from_slice(data);
        p
    }

    #[test]
    fn len_survives_a_poisoned_lock() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        manager.on_key_added(&key(ED25519_WORK)).unwrap();

        let poisoned = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = manager.identities.write().unwrap();
                    panic!("poison the identity set");
                })
                .join()
        });
        assert!(poisoned.is_err());
        assert!(manager.identities.is_poisoned());

        assert_eq!(manager.len(), 1);
        assert!(!manager.is_empty());
        assert!(matches!(manager.user_ids(), Err(GpgError::Poisoned)));
    }

    #[test]
    fn unmatched_comment_derives_nothing() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        let added = manager.on_key_added(&key(ED25519_PERSONAL)).unwrap();
        assert_eq!(added, 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn every_matching_rule_adds_an_identity() {
        let manager = IdentityManager::new(vec![
            rule("work-laptop", "Jane", "jane@work"),
            rule("work-laptop", "Jane", "jane@oss"),
            rule("personal", "Jane", "jane@home"),
        ]);
        assert_eq!(manager.on_key_added(&key(ED25519_WORK)).unwrap(), 2);
        assert_eq!(
            manager.user_ids().unwrap(),
            vec!["Jane <jane@work>", "Jane <jane@oss>"]
        );
    }

    #[test]
    fn re_adding_a_key_replaces_its_identities() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        manager.on_key_added(&key(ED25519_WORK)).unwrap();
        manager.on_key_added(&key(ED25519_WORK)).unwrap();
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn unsupported_key_type_is_reported() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        let err = manager.on_key_added(&key(ECDSA_WORK)).unwrap_err();
        assert!(matches!(err, GpgError::UnsupportedKeyType(_)));
        assert!(manager.is_empty());
    }

    #[test]
    fn invalid_rule_does_not_block_valid_ones() {
        let manager = IdentityManager::new(vec![
            rule("work-laptop", "Bad <name>", "x@y"),
            rule("work-laptop", "Jane", "jane@work"),
        ]);
        let err = manager.on_key_added(&key(ED25519_WORK)).unwrap_err();
        assert!(matches!(err, GpgError::InvalidUserId(_)));
        assert_eq!(manager.user_ids().unwrap(), vec!["Jane <jane@work>"]);
    }

    #[test]
    fn removing_b_leaves_a_and_c_in_order() {
        let manager = IdentityManager::new(vec![
            rule("a", "A", "a@x"),
            rule("b", "B", "b@x"),
            rule("c", "C", "c@x"),
        ]);
        let a = key_with_comment(ED25519_WORK, "a");
        let b = key_with_comment(RSA_WORK, "b");
        let c = key_with_comment(ED25519_PERSONAL, "c");
        for k in [&a, &b, &c] {
            manager.on_key_added(k).unwrap();
        }

        let removed = manager
            .on_key_removed(b.public_key().key_data())
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(manager.user_ids().unwrap(), vec!["A <a@x>", "C <c@x>"]);
    }

    #[test]
    fn removing_unknown_key_is_a_no_op() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        manager.on_key_added(&key(ED25519_WORK)).unwrap();
        let other = key(ED25519_PERSONAL);
        assert_eq!(manager.on_key_removed(other.public_key().key_data()).unwrap(), 0);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn remove_all_clears() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        manager.on_key_added(&key(ED25519_WORK)).unwrap();
        manager.on_remove_all().unwrap();
        assert!(manager.is_empty());
    }

    #[test]
    fn sign_produces_armored_signature() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        manager.on_key_added(&key(ED25519_WORK)).unwrap();
        let out = manager
            .sign(&payload("Jane <jane@work>", b"commit body"))
            .unwrap();
        assert!(out.starts_with(b"-----BEGIN PGP SIGNATURE-----"));
    }

    #[test]
    fn sign_without_nul_in_prefix_fails() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        manager.on_key_added(&key(ED25519_WORK)).unwrap();
        let mut p = vec![b'x'; USER_ID_FIELD_LEN];
        p.extend_from_slice(b"\0data");
        let err = manager.sign(&p).unwrap_err();
        assert!(matches!(err, GpgError::NoSignerForIdentity(_)));
    }

    #[test]
    fn sign_with_unknown_user_id_fails() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        manager.on_key_added(&key(ED25519_WORK)).unwrap();
        let err = manager
            .sign(&payload("Mallory <m@x>", b"data"))
            .unwrap_err();
        assert!(matches!(err, GpgError::NoSignerForIdentity(ref u) if u == "Mallory <m@x>"));
    }

    #[test]
    fn short_payload_is_handled() {
        let manager = IdentityManager::new(vec![rule("work-laptop", "Jane", "jane@work")]);
        manager.on_key_added(&key(ED25519_WORK)).unwrap();
        // Shorter than the user-id field: the whole payload is the field and
        // the signed data is empty.
        let out = manager.sign(b"Jane <jane@work>\0").unwrap();
        assert!(out.starts_with(b"-----BEGIN PGP SIGNATURE-----"));
        assert!(manager.sign(b"").is_err());
    }

    #[test]
    fn last_registered_identity_wins() {
        let manager = IdentityManager::new(vec![
            rule("a", "Jane", "jane@work"),
            rule("b", "Jane", "jane@work"),
        ]);
        let first = key_with_comment(ED25519_WORK, "a");
        let second = key_with_comment(RSA_WORK, "b");
        manager.on_key_added(&first).unwrap();
        manager.on_key_added(&second).unwrap();

        let out = manager.sign(&payload("Jane <jane@work>", b"x")).unwrap();
        let text = String::from_utf8(out).unwrap();
        // RSA-2048 signatures armor to far more text than Ed25519 ones.
        assert!(text.len() > 400, "expected RSA signature, got {text}");
    }

    #[test]
    fn rules_can_be_replaced() {
        let manager = IdentityManager::new(Vec::new());
        assert_eq!(manager.on_key_added(&key(ED25519_WORK)).unwrap(), 0);
        manager
            .set_rules(vec![rule("work-laptop", "Jane", "jane@work")])
            .unwrap();
        assert_eq!(manager.on_key_added(&key(ED25519_WORK)).unwrap(), 1);
    }
}
