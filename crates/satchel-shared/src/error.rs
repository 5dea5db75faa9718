use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Signature verification failed")]
    BadSignature,
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
