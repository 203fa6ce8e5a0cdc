use markmirror_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The provider could not be reached.  Incremental events are simply not
    /// delivered; the mirror catches up on the next successful full sync.
    #[error("bookmark provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("bookmark provider returned an invalid tree: {0}")]
    InvalidTree(String),

    #[error("full sync superseded by a newer request")]
    Superseded,

    #[error("sync coordinator is not running")]
    CoordinatorStopped,
}

pub type Result<T> = std::result::Result<T, SyncError>;
