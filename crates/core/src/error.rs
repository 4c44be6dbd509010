use thiserror::Error;

pub type AdResult<T> = Result<T, AdError>;

/// Error kinds surfaced by the decisioning engine and its collaborators.
///
/// `NoAd`, `PacingLimitReached` and `RateLimitReached` are not errors from
/// the client's point of view; the HTTP surface maps all three to an
/// empty-seatbid response and they exist as distinct kinds for observability.
#[derive(Error, Debug)]
pub enum AdError {
    #[error("unknown placement: {0}")]
    UnknownPlacement(String),

    #[error("no ad available")]
    NoAd,

    #[error("all candidates throttled by pacing")]
    PacingLimitReached,

    #[error("all candidates rate limited")]
    RateLimitReached,

    #[error("counter store unavailable")]
    CounterStoreUnavailable,

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
