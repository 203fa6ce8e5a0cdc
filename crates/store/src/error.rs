#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The redb file could not be opened, read, or committed.  Fatal to the
    /// current sync run; the mirror is rebuilt from the provider later.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaMismatch { found: u32, supported: u32 },

    #[error("schema migration from version {from} failed: {reason}")]
    MigrationFailed { from: u32, reason: String },

    #[error("record encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    /// True for conditions that should surface to users as a failed sync
    /// rather than be retried silently.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. } | Self::MigrationFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

macro_rules! unavailable_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    Self::Unavailable(redb::Error::from(err).to_string())
                }
            }
        )*
    };
}

unavailable_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
