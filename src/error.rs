use thiserror::Error;

/// Failure taxonomy for a backend operation (spec §4.1): success, not-found,
/// not-readable (directory without listing permission), or I/O error.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object not found")]
    NotFound,
    #[error("object not readable")]
    NotReadable,
    #[error("backend io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure taxonomy surfaced by the zone handler, one variant per terminal
/// status in spec §7.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("not found")]
    NotFound,
    #[error("forbidden by policy")]
    ForbiddenByPolicy,
    #[error("object gone")]
    Gone,
    #[error("object expired")]
    Expired,
    #[error("access limit reached")]
    AccessLimitReached,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("range not satisfiable")]
    RangeNotSatisfiable,
    #[error("too many requests")]
    RequestLimited,
    #[error("too many connections")]
    ConnectionLimited,
    #[error("backend io error: {0}")]
    BackendIo(#[from] BackendError),
    #[error("purge failed: {0}")]
    PurgeFailed(String),
}

/// Configuration load failures. All are fatal at startup (spec §7).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl From<BackendError> for std::io::Error {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound => std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
            BackendError::NotReadable => {
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, e.to_string())
            }
            BackendError::Io(io_err) => io_err,
        }
    }
}
