/// Error types shared across the notebook crates.
///
/// These errors represent failures in infrastructure components (Redis, JSON payloads)
/// that any server in the workspace may hit. Domain errors are defined in the domain
/// crate and wrap `CommonError` via `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis unavailable, degrading gracefully")]
    RedisUnavailable,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
