use libopque::OpStatus;
use log::debug;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LioError>;

#[derive(Debug, Error)]
pub enum LioError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    Exists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("exnode error: {0}")]
    Exnode(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation aborted")]
    Aborted,

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Opque(#[from] libopque::OpqueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LioError {
    /// errno-style code carried in a failed operation's status.
    pub fn code(&self) -> i32 {
        match self {
            LioError::NotFound(_) => libc::ENOENT,
            LioError::Exists(_) => libc::EEXIST,
            LioError::NotEmpty(_) => libc::ENOTEMPTY,
            LioError::InvalidPath(_) | LioError::InvalidConfig(_) | LioError::Regex(_) => {
                libc::EINVAL
            }
            LioError::Timeout(_) => libc::ETIMEDOUT,
            LioError::Aborted => libc::ECANCELED,
            LioError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            LioError::Backend(_)
            | LioError::Exnode(_)
            | LioError::Walk(_)
            | LioError::Opque(_)
            | LioError::Other(_) => libc::EIO,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LioError::NotFound(_))
    }
}

/// Status of an operation whose body produced `res`.
pub(crate) fn op_status<T>(what: &str, res: &Result<T>) -> OpStatus {
    match res {
        Ok(_) => OpStatus::success(),
        Err(e) => {
            debug!("{what} failed: {e}");
            OpStatus::failure_with(e.code())
        }
    }
}
