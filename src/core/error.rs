use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EspromError {
    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Block is dirty with data from file {owner}, refusing flush from file {requester}")]
    CrossOwnerConflict { owner: u64, requester: u64 },

    #[error("Seek target {target} is outside the addressable range 0..={size}")]
    SeekOverrun { target: i128, size: u64 },

    #[error("Malformed ROM: {0}")]
    Format(String),

    #[error("Sample id {id} out of range (catalog holds {count} samples)")]
    OutOfRange { id: usize, count: usize },
}

pub type Result<T> = std::result::Result<T, EspromError>;

impl From<std::io::Error> for EspromError {
    /// Recovers the original error when an `EspromError` was carried
    /// through one of the `std::io` trait impls.
    fn from(err: std::io::Error) -> Self {
        let wrapped = err
            .get_ref()
            .is_some_and(|inner| inner.is::<EspromError>());
        if !wrapped {
            return EspromError::Io(err);
        }

        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<EspromError>()) {
            Some(Ok(esprom)) => *esprom,
            Some(Err(inner)) => EspromError::Io(std::io::Error::new(kind, inner)),
            None => EspromError::Io(kind.into()),
        }
    }
}

impl From<EspromError> for std::io::Error {
    fn from(err: EspromError) -> Self {
        match err {
            EspromError::Io(inner) => inner,
            other => {
                let kind = match &other {
                    EspromError::SeekOverrun { .. } | EspromError::OutOfRange { .. } => {
                        std::io::ErrorKind::InvalidInput
                    }
                    EspromError::Format(_) => std::io::ErrorKind::InvalidData,
                    EspromError::Allocation(_) => std::io::ErrorKind::OutOfMemory,
                    _ => std::io::ErrorKind::Other,
                };
                std::io::Error::new(kind, other)
            }
        }
    }
}
