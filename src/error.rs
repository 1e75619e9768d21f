//! Error types for device and configuration operations

use thiserror::Error;

/// Status reported by a failed platform operation
///
/// This is the payload of `open_failed` / `close_failed` and the error type of
/// every [`PlatformDevice`](crate::platform::PlatformDevice) method. It is
/// `Clone` so one failure can be fanned out to several subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device not found")]
    NotFound,

    #[error("Device is held exclusively by another client: {0}")]
    ExclusiveAccess(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device is not open")]
    NotOpen,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Platform error code {0}")]
    Platform(i32),
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        let msg = e.to_string();
        match e.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => DeviceError::PermissionDenied(msg),
            Some(libc::EBUSY) => DeviceError::ExclusiveAccess(msg),
            Some(libc::ENODEV) | Some(libc::ENOENT) => DeviceError::NotFound,
            _ => match e.kind() {
                std::io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(msg),
                std::io::ErrorKind::NotFound => DeviceError::NotFound,
                _ => DeviceError::Io(msg),
            },
        }
    }
}

/// Errors raised while parsing a [`Config`](crate::config::Config)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let e = std::io::Error::from_raw_os_error(libc::EBUSY);
        assert!(matches!(DeviceError::from(e), DeviceError::ExclusiveAccess(_)));

        let e = std::io::Error::from_raw_os_error(libc::EACCES);
        assert!(matches!(DeviceError::from(e), DeviceError::PermissionDenied(_)));

        let e = std::io::Error::from_raw_os_error(libc::ENODEV);
        assert_eq!(DeviceError::from(e), DeviceError::NotFound);

        let e = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(DeviceError::from(e), DeviceError::Io("boom".into()));
    }
}
