use crate::backend::NativeStatus;
use crate::variant::DeviceKind;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type CryptResult<T> = Result<T, CryptError>;

/// Errno values used by backends when reporting a failed primitive.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const ENOTBLK: i32 = 15;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENOTSUP: i32 = 95;
}

/// Coarse classification callers use to decide between re-prompting,
/// reporting, or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    NotActive,
    InvalidArgument,
    WrongCredential,
    HeaderInvalid,
    Unsupported,
    Cancelled,
    ResourceExhausted,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::NotActive => "not active",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::WrongCredential => "wrong credential",
            ErrorKind::HeaderInvalid => "header invalid",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum CryptError {
    #[error("[CV1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[CV1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[CV1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[CV1003] json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[CV1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[CV1300] failed to decode key material at {path}: {reason}")]
    InvalidKeyFile { path: PathBuf, reason: String },

    #[error("[CV2000] backend error: {0}")]
    Backend(String),

    #[error("[CV2100] function '{function}' returned error with code '{code}'")]
    Native { function: &'static str, code: i32 },

    #[error("[CV2200] Operation unsupported for this device type ({kind}, {function})")]
    Unsupported {
        function: &'static str,
        kind: DeviceKind,
    },

    #[error("[CV2300] '{function}' called on a released device handle")]
    Released { function: &'static str },
}

impl CryptError {
    /// Wrap a backend status reported by `function`.
    pub fn native(function: &'static str, status: NativeStatus) -> Self {
        CryptError::Native {
            function,
            code: status.code(),
        }
    }

    /// Stable identifier printed in the message prefix.
    pub fn ident(&self) -> &'static str {
        match self {
            CryptError::Io(_) => "CV1000",
            CryptError::Toml(_) => "CV1001",
            CryptError::Yaml(_) => "CV1002",
            CryptError::Json(_) => "CV1003",
            CryptError::InvalidConfig(_) => "CV1100",
            CryptError::InvalidKeyFile { .. } => "CV1300",
            CryptError::Backend(_) => "CV2000",
            CryptError::Native { .. } => "CV2100",
            CryptError::Unsupported { .. } => "CV2200",
            CryptError::Released { .. } => "CV2300",
        }
    }

    /// Signed errno-style status, when the failure came from a primitive.
    pub fn code(&self) -> Option<i32> {
        match self {
            CryptError::Native { code, .. } => Some(*code),
            CryptError::Released { .. } => Some(-errno::EINVAL),
            _ => None,
        }
    }

    /// Name of the primitive that failed, if any.
    pub fn function(&self) -> Option<&'static str> {
        match self {
            CryptError::Native { function, .. }
            | CryptError::Unsupported { function, .. }
            | CryptError::Released { function } => Some(function),
            _ => None,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, CryptError::Unsupported { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptError::Native { function, code } => classify(function, *code),
            CryptError::Unsupported { .. } => ErrorKind::Unsupported,
            CryptError::Released { .. } => ErrorKind::InvalidArgument,
            CryptError::InvalidConfig(_) | CryptError::InvalidKeyFile { .. } => {
                ErrorKind::InvalidArgument
            }
            CryptError::Io(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            _ => ErrorKind::Other,
        }
    }
}

/// Map a primitive's status into the taxonomy. `crypt_load` reports an
/// unrecognised header as EINVAL, which is a header problem rather than a
/// caller mistake.
fn classify(function: &str, code: i32) -> ErrorKind {
    match -code {
        errno::EPERM => ErrorKind::WrongCredential,
        errno::ENOENT | errno::ENOTBLK => ErrorKind::NotFound,
        errno::ENODEV => ErrorKind::NotActive,
        errno::EINVAL if function == "crypt_load" => ErrorKind::HeaderInvalid,
        errno::EINVAL | errno::EEXIST => ErrorKind::InvalidArgument,
        errno::EINTR => ErrorKind::Cancelled,
        errno::ENOMEM | errno::ENOSPC => ErrorKind::ResourceExhausted,
        _ => ErrorKind::Other,
    }
}
