//! Deterministic OpenPGP identities built from SSH private keys.
//!
//! The primary key reuses the SSH key material unchanged and is stamped with
//! the Unix epoch as its creation time, so the same SSH key always yields the
//! same OpenPGP fingerprint and self-signature metadata.  Nothing is written
//! to disk; the identity lives as long as the SSH key stays loaded.

use std::io::Write as _;
use std::time::UNIX_EPOCH;

use sequoia_openpgp as openpgp;

use openpgp::armor;
use openpgp::cert::Cert;
use openpgp::crypto::Signer as _;
use openpgp::crypto::hash::Digest as _;
use openpgp::packet::key::{Key4, PrimaryRole, SecretParts};
use openpgp::packet::signature::SignatureBuilder;
use openpgp::packet::signature::subpacket::SubpacketTag;
use openpgp::packet::{Key, Packet, Signature, UserID, signature::Signature4};
use openpgp::serialize::SerializeInto as _;
use openpgp::serialize::stream::{Armorer, Message, Signer};
use openpgp::types::{
    AEADAlgorithm, Features, HashAlgorithm, KeyFlags, SignatureType, SymmetricAlgorithm,
};
use ssh_encoding::Encode as _;
use ssh_key::private::KeypairData;
use ssh_key::public::KeyData;
use ssh_key::{HashAlg, Mpint, PrivateKey};

use crate::error::GpgError;

pub const DEFAULT_HASH: HashAlgorithm = HashAlgorithm::SHA256;
pub const DEFAULT_CIPHER: SymmetricAlgorithm = SymmetricAlgorithm::AES256;
pub const DEFAULT_AEAD: AEADAlgorithm = AEADAlgorithm::EAX;

// Mandatory-to-implement algorithms every OpenPGP peer understands.
const BASELINE_HASH: HashAlgorithm = HashAlgorithm::SHA256;
const BASELINE_CIPHER: SymmetricAlgorithm = SymmetricAlgorithm::AES128;
const BASELINE_AEAD: AEADAlgorithm = AEADAlgorithm::EAX;

/// An OpenPGP signing key derived from one loaded SSH key.
pub struct SigningIdentity {
    user_id: String,
    key: Key<SecretParts, PrimaryRole>,
    cert: Cert,
    ssh_public: Vec<u8>,
    ssh_fingerprint: String,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("user_id", &self.user_id)
            .field("fingerprint", &self.cert.fingerprint().to_hex())
            .field("ssh_fingerprint", &self.ssh_fingerprint)
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    /// Build a self-certified identity `name <email>` from `private_key`.
    pub fn derive(private_key: &PrivateKey, name: &str, email: &str) -> Result<Self, GpgError> {
        let user_id = user_id(name, "", email)?;
        let key = primary_key(private_key.key_data())?;

        let uid = UserID::from(user_id.as_str());
        let binding = certify(&key, &uid)?;

        let public = key.clone().parts_into_public();
        let cert = Cert::try_from(vec![
            Packet::from(public),
            Packet::from(uid),
            Packet::from(binding),
        ])?;

        let public_key = private_key.public_key();
        Ok(Self {
            user_id,
            key,
            cert,
            ssh_public: wire_encoding(public_key.key_data())?,
            ssh_fingerprint: public_key.fingerprint(HashAlg::Sha256).to_string(),
        })
    }

    /// The `Name <email>` string clients put in the `gpg-sign` prefix.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Public certificate: primary key, user ID and its self-signature.
    pub fn cert(&self) -> &Cert {
        &self.cert
    }

    /// Wire encoding of the source SSH public key.
    pub fn ssh_public_key(&self) -> &[u8] {
        &self.ssh_public
    }

    pub fn ssh_fingerprint(&self) -> &str {
        &self.ssh_fingerprint
    }

    /// ASCII-armored public certificate, suitable for `gpg --import`.
    pub fn armored_public_key(&self) -> Result<String, GpgError> {
        let bytes = self.cert.armored().to_vec()?;
        String::from_utf8(bytes).map_err(|e| GpgError::OpenPgp(e.into()))
    }

    /// Detached, armored signature over `data`.
    pub fn sign_detached(&self, data: &[u8]) -> Result<Vec<u8>, GpgError> {
        let keypair = self.key.clone().into_keypair()?;

        let mut sink = Vec::new();
        let message = Message::new(&mut sink);
        let message = Armorer::new(message)
            .kind(armor::Kind::Signature)
            .build()?;
        let mut signer = Signer::new(message, keypair)
            .detached()
            .hash_algo(DEFAULT_HASH)?
            .build()?;
        signer
            .write_all(data)
            .map_err(|e| GpgError::OpenPgp(e.into()))?;
        signer.finalize()?;

        Ok(sink)
    }
}

/// Marshal an SSH public key the way it appears on the agent wire.
pub fn wire_encoding(key: &KeyData) -> Result<Vec<u8>, GpgError> {
    let mut buf = Vec::new();
    key.encode(&mut buf)
        .map_err(|e| GpgError::SshKey(e.to_string()))?;
    Ok(buf)
}

/// Format an OpenPGP user ID as `name (comment) <email>`, omitting empty
/// parts.  Parentheses, angle brackets and NUL are rejected in every field.
pub fn user_id(name: &str, comment: &str, email: &str) -> Result<String, GpgError> {
    for field in [name, comment, email] {
        if field.contains(['(', ')', '<', '>', '\0']) {
            return Err(GpgError::InvalidUserId(field.to_string()));
        }
    }

    let mut id = name.to_string();
    if !comment.is_empty() {
        if !id.is_empty() {
            id.push(' ');
        }
        id.push('(');
        id.push_str(comment);
        id.push(')');
    }
    if !email.is_empty() {
        if !id.is_empty() {
            id.push(' ');
        }
        id.push('<');
        id.push_str(email);
        id.push('>');
    }
    Ok(id)
}

fn primary_key(key_data: &KeypairData) -> Result<Key<SecretParts, PrimaryRole>, GpgError> {
    let key = match key_data {
        KeypairData::Ed25519(keypair) => {
            let seed: &[u8; 32] = keypair.private.as_ref();
            Key4::<SecretParts, PrimaryRole>::import_secret_ed25519(seed, UNIX_EPOCH)?
        }
        KeypairData::Rsa(keypair) => Key4::<SecretParts, PrimaryRole>::import_secret_rsa(
            positive(&keypair.private.d)?,
            positive(&keypair.private.p)?,
            positive(&keypair.private.q)?,
            UNIX_EPOCH,
        )?,
        other => {
            let name = other
                .algorithm()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(GpgError::UnsupportedKeyType(name));
        }
    };
    Ok(key.into())
}

fn positive(value: &Mpint) -> Result<&[u8], GpgError> {
    value
        .as_positive_bytes()
        .ok_or_else(|| GpgError::SshKey("negative RSA component".to_string()))
}

/// `[default]`, plus `baseline` when the default differs from it.
fn preferences<T: PartialEq + Copy>(default: T, baseline: T) -> Vec<T> {
    if default == baseline {
        vec![default]
    } else {
        vec![default, baseline]
    }
}

/// Positive self-certification of `uid`, byte-identical on every run.
///
/// `SignatureBuilder` always salts the hashed area with a random notation,
/// so the binding is hashed and signed here with that notation removed.
/// Ed25519 and PKCS#1 v1.5 signatures are themselves deterministic.
fn certify(key: &Key<SecretParts, PrimaryRole>, uid: &UserID) -> Result<Signature, GpgError> {
    let mut keypair = key.clone().into_keypair()?;
    let mut template = self_signature()?.pre_sign(&keypair)?;
    template
        .hashed_area_mut()
        .remove_all(SubpacketTag::NotationData);

    let mut hash = template.hash_algo().context()?;
    template.hash_userid_binding(&mut hash, key.parts_as_public(), uid);
    let digest = hash.into_digest()?;
    let mpis = keypair.sign(template.hash_algo(), &digest)?;

    Ok(Signature4::new(
        template.typ(),
        key.pk_algo(),
        template.hash_algo(),
        template.hashed_area().clone(),
        template.unhashed_area().clone(),
        [digest[0], digest[1]],
        mpis,
    )
    .into())
}

#[allow(deprecated)]
fn self_signature() -> Result<SignatureBuilder, GpgError> {
    let builder = SignatureBuilder::new(SignatureType::PositiveCertification)
        .set_signature_creation_time(UNIX_EPOCH)?
        .set_key_flags(KeyFlags::empty().set_signing().set_certification())?
        .set_primary_userid(true)?
        .set_hash_algo(DEFAULT_HASH)
        .set_preferred_hash_algorithms(preferences(DEFAULT_HASH, BASELINE_HASH))?
        .set_preferred_symmetric_algorithms(preferences(DEFAULT_CIPHER, BASELINE_CIPHER))?
        .set_preferred_aead_algorithms(preferences(DEFAULT_AEAD, BASELINE_AEAD))?
        .set_features(Features::empty().set_seipdv1())?;
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use openpgp::KeyHandle;
    use openpgp::parse::Parse as _;
    use openpgp::parse::stream::{
        DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper,
    };
    use openpgp::policy::StandardPolicy;
    use openpgp::serialize::{MarshalInto, SerializeInto};

    use super::*;

    const ED25519: &str = include_str!("../testdata/ed25519_work");
    const RSA: &str = include_str!("../testdata/rsa_work");
    const ECDSA: &str = include_str!("../testdata/ecdsa_work");

    fn load(pem: &str) -> PrivateKey {
        PrivateKey::from_openssh(pem).unwrap()
    }

    fn binding(identity: &SigningIdentity) -> Signature {
        identity
            .cert()
            .userids()
            .next()
            .unwrap()
            .self_signatures()
            .next()
            .unwrap()
            .clone()
    }

    #[allow(deprecated)]
    fn metadata(identity: &SigningIdentity) -> String {
        let binding = binding(identity);
        format!(
            "{} {:?} {:?} {:?} {:?} {:?} {:?} {:?} {:?} {:?}",
            identity.cert().fingerprint(),
            binding.typ(),
            binding.hash_algo(),
            binding.signature_creation_time(),
            binding.key_flags(),
            binding.primary_userid(),
            binding.preferred_hash_algorithms(),
            binding.preferred_symmetric_algorithms(),
            binding.preferred_aead_algorithms(),
            binding.features(),
        )
    }

    struct Helper<'a>(&'a Cert);

    impl VerificationHelper for Helper<'_> {
        fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
            Ok(vec![self.0.clone()])
        }

        fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
            for layer in structure.into_iter() {
                if let MessageLayer::SignatureGroup { results } = layer {
                    if results.iter().any(|r| r.is_ok()) {
                        return Ok(());
                    }
                }
            }
            Err(anyhow::anyhow!("no valid signature"))
        }
    }

    fn verify(cert: &Cert, signature: &[u8], data: &[u8]) -> openpgp::Result<()> {
        let policy = StandardPolicy::new();
        let mut verifier = DetachedVerifierBuilder::from_bytes(signature)?
            .with_policy(&policy, None, Helper(cert))?;
        verifier.verify_bytes(data)
    }

    #[test]
    fn user_id_formatting() {
        assert_eq!(
            user_id("Jane Doe", "", "jane@example.com").unwrap(),
            "Jane Doe <jane@example.com>"
        );
        assert_eq!(user_id("Jane", "laptop", "").unwrap(), "Jane (laptop)");
        assert_eq!(user_id("", "", "a@b").unwrap(), "<a@b>");
        assert_eq!(user_id("", "", "").unwrap(), "");
    }

    #[test]
    fn user_id_rejects_reserved_characters() {
        for bad in ["Jane <x>", "Jane (x)", "nul\0"] {
            assert!(matches!(
                user_id(bad, "", "jane@example.com"),
                Err(GpgError::InvalidUserId(_))
            ));
        }
        assert!(matches!(
            user_id("Jane", "", "<jane@example.com>"),
            Err(GpgError::InvalidUserId(_))
        ));
    }

    #[test]
    fn preference_lists_append_baseline() {
        assert_eq!(
            preferences(DEFAULT_CIPHER, BASELINE_CIPHER),
            vec![SymmetricAlgorithm::AES256, SymmetricAlgorithm::AES128]
        );
        assert_eq!(
            preferences(DEFAULT_HASH, BASELINE_HASH),
            vec![HashAlgorithm::SHA256]
        );
        assert_eq!(
            preferences(DEFAULT_AEAD, BASELINE_AEAD),
            vec![AEADAlgorithm::EAX]
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        for pem in [ED25519, RSA] {
            let key = load(pem);
            let a = SigningIdentity::derive(&key, "Jane Doe", "jane@example.com").unwrap();
            let b = SigningIdentity::derive(&key, "Jane Doe", "jane@example.com").unwrap();
            assert_eq!(a.cert().fingerprint(), b.cert().fingerprint());
            assert_eq!(metadata(&a), metadata(&b));
            assert_eq!(a.ssh_public_key(), b.ssh_public_key());

            let (sig_a, sig_b) = (binding(&a), binding(&b));
            assert_eq!(
                MarshalInto::to_vec(sig_a.hashed_area()).unwrap(),
                MarshalInto::to_vec(sig_b.hashed_area()).unwrap()
            );
            assert_eq!(
                SerializeInto::to_vec(a.cert()).unwrap(),
                SerializeInto::to_vec(b.cert()).unwrap()
            );
        }
    }

    #[test]
    fn self_signature_is_unsalted() {
        let identity =
            SigningIdentity::derive(&load(ED25519), "Jane Doe", "jane@example.com").unwrap();
        let sig = binding(&identity);
        assert_eq!(sig.notation_data().count(), 0);
        assert!(sig.issuer_fingerprints().next().is_some());
    }

    #[test]
    fn self_signature_carries_expected_metadata() {
        let identity =
            SigningIdentity::derive(&load(ED25519), "Jane Doe", "jane@example.com").unwrap();
        assert_eq!(identity.user_id(), "Jane Doe <jane@example.com>");

        let binding = identity
            .cert()
            .userids()
            .next()
            .unwrap()
            .self_signatures()
            .next()
            .unwrap()
            .clone();
        assert_eq!(binding.typ(), SignatureType::PositiveCertification);
        assert_eq!(binding.signature_creation_time(), Some(UNIX_EPOCH));
        assert_eq!(binding.primary_userid(), Some(true));
        let flags = binding.key_flags().unwrap();
        assert!(flags.for_signing());
        assert!(flags.for_certification());
        assert_eq!(
            binding.preferred_symmetric_algorithms(),
            Some(&[SymmetricAlgorithm::AES256, SymmetricAlgorithm::AES128][..])
        );
        assert_eq!(
            identity.cert().primary_key().key().creation_time(),
            UNIX_EPOCH
        );
    }

    #[test]
    fn self_signature_verifies_against_primary_key() {
        for pem in [ED25519, RSA] {
            let identity =
                SigningIdentity::derive(&load(pem), "Jane Doe", "jane@example.com").unwrap();
            let cert = identity.cert();
            let uid = cert.userids().next().unwrap();
            let mut binding = uid.self_signatures().next().unwrap().clone();
            let primary = cert.primary_key().key();
            binding
                .verify_userid_binding(primary, primary, uid.userid())
                .unwrap();

            let policy = StandardPolicy::new();
            let valid = cert.with_policy(&policy, None).unwrap();
            assert_eq!(
                valid.primary_userid().unwrap().userid().value(),
                b"Jane Doe <jane@example.com>"
            );
        }
    }

    #[test]
    fn detached_signature_verifies() {
        for pem in [ED25519, RSA] {
            let identity =
                SigningIdentity::derive(&load(pem), "Jane Doe", "jane@example.com").unwrap();
            let data = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n";
            let signature = identity.sign_detached(data).unwrap();

            let text = String::from_utf8(signature.clone()).unwrap();
            assert!(text.starts_with("-----BEGIN PGP SIGNATURE-----"));
            verify(identity.cert(), &signature, data).unwrap();
            assert!(verify(identity.cert(), &signature, b"tampered").is_err());
        }
    }

    #[test]
    fn armored_public_key_has_no_secrets() {
        let identity =
            SigningIdentity::derive(&load(ED25519), "Jane Doe", "jane@example.com").unwrap();
        let armored = identity.armored_public_key().unwrap();
        assert!(armored.starts_with("-----BEGIN PGP PUBLIC KEY BLOCK-----"));

        let parsed = Cert::from_bytes(armored.as_bytes()).unwrap();
        assert_eq!(parsed.fingerprint(), identity.cert().fingerprint());
        assert!(!parsed.is_tsk());
    }

    #[test]
    fn ecdsa_is_unsupported() {
        let err = SigningIdentity::derive(&load(ECDSA), "Jane", "jane@example.com").unwrap_err();
        assert!(matches!(err, GpgError::UnsupportedKeyType(_)));
    }

    #[test]
    fn invalid_name_is_rejected_before_key_import() {
        let err = SigningIdentity::derive(&load(ED25519), "Jane <evil>", "x@y").unwrap_err();
        assert!(matches!(err, GpgError::InvalidUserId(_)));
    }
}
