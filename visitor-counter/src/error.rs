use {
    thiserror::Error,
    crate::kv::StorageError,
};

#[derive(Error, Debug, Eq, PartialEq)]
pub enum CounterError {
    /// Counter record does not exist and the service is configured not to create it.
    #[error("counter record not found: {key}")]
    NotFound { key: String },

    /// Storage failed, timed out or kept rejecting conditional writes.
    /// Similar to 503: the caller may try again later.
    #[error("counter store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// Stored count is not a non-negative decimal integer. Never reset automatically.
    #[error("stored counter value is corrupt: {value:?}")]
    CorruptData { value: String },

    #[error("counter can not be incremented past u64::MAX")]
    Overflow,

    #[error("counter record already exists: {key}")]
    AlreadyExists { key: String },
}

impl CounterError {
    /// Short label, used for metrics and for the body of error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::CorruptData { .. } => "corrupt_data",
            Self::Overflow => "overflow",
            Self::AlreadyExists { .. } => "already_exists",
        }
    }
}

impl From<StorageError> for CounterError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InternalError { description }
            | StorageError::Unavailable { description } => Self::StoreUnavailable { reason: description },
            StorageError::KeyConstraintError { description } => Self::StoreUnavailable {
                reason: format!("storage rejected counter key: {description}"),
            },
            StorageError::Conflict => Self::StoreUnavailable {
                reason: "unexpected conflicting write outside of retry loop".to_owned(),
            },
        }
    }
}
