//! Error types for OpenPGP identity derivation and signing.

#[derive(Debug, thiserror::Error)]
pub enum GpgError {
    #[error("unsupported key type for OpenPGP derivation: {0}")]
    UnsupportedKeyType(String),

    #[error("user id field contained invalid characters: {0:?}")]
    InvalidUserId(String),

    #[error("no GPG signer found for {0:?}")]
    NoSignerForIdentity(String),

    #[error("malformed SSH key: {0}")]
    SshKey(String),

    #[error("OpenPGP: {0}")]
    OpenPgp(#[from] anyhow::Error),

    #[error("identity set lock poisoned")]
    Poisoned,
}
