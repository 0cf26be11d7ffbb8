use thiserror::Error;

#[derive(Error, Debug)]
pub enum TtmError {
    #[error("Resource busy")]
    Busy,

    #[error("Operation must be restarted")]
    Retry,

    #[error("Out of aperture space or memory quota")]
    OutOfMemory,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid memory type: {0}")]
    InvalidMemType(u32),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Driver Error: {0}")]
    Driver(String),
}

impl TtmError {
    /// Negative errno reported to the layer above the buffer manager.
    #[must_use]
    pub fn errno(&self) -> i32 {
        -match self {
            Self::Busy => libc::EBUSY,
            Self::Retry => libc::EAGAIN,
            Self::OutOfMemory => libc::ENOMEM,
            Self::InvalidArgument(_) | Self::InvalidMemType(_) => libc::EINVAL,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Driver(_) => libc::EIO,
        }
    }

    /// Restarts are expected and not worth logging.
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }

    /// `Busy` and `Retry` may succeed if the caller re-drives the operation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::Retry)
    }
}

// A convenient alias
pub type TtmResult<T> = Result<T, TtmError>;
