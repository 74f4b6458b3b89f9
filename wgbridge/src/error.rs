use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WgError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Control socket error: {0}")]
    Uapi(#[from] UapiError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    #[error("Network interface '{0}' already exists")]
    InterfaceExists(String),

    #[error("Log directory {0} does not exist")]
    MissingLogDir(PathBuf),
}

/// Fatal failures of the device lifecycle. Any resource opened by the failed
/// attempt has been released by the time one of these is returned.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to create TUN device: {0}")]
    InterfaceCreationFailed(#[source] io::Error),

    #[error("UAPI listen error: {0}")]
    ControlSocketOpenFailed(#[source] io::Error),

    #[error("Failed to listen on uapi socket: {0}")]
    ControlSocketListenFailed(#[source] io::Error),

    #[error("Failed to apply initial configuration: {0}")]
    InitialConfigFailed(#[source] UapiError),

    #[error("Failed to bring device up: {0}")]
    MarkUpFailed(#[source] io::Error),

    #[error("Failed to subscribe to termination signals: {0}")]
    SignalSetupFailed(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to create logfile {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to locate current executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("failed starting background process: {0}")]
    Spawn(#[source] io::Error),
}

/// Errors raised while ingesting a configuration transaction. Each maps to
/// the negative errno reported back on the control socket.
#[derive(Error, Debug)]
pub enum UapiError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("unexpected key: {0}")]
    UnexpectedKey(String),

    #[error("malformed line: {0}")]
    MalformedLine(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("failed to bind listen port {port}: {source}")]
    PortInUse {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UapiError {
    pub fn invalid(key: &str, value: &str) -> Self {
        UapiError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    /// Status code written as `errno=<code>` in the transaction response.
    pub fn errno(&self) -> i64 {
        let code = match self {
            UapiError::InvalidValue { .. }
            | UapiError::UnexpectedKey(_)
            | UapiError::MalformedLine(_) => libc::EINVAL,
            UapiError::UnknownOperation(_) => libc::EPROTO,
            UapiError::PortInUse { .. } => libc::EADDRINUSE,
            UapiError::Io(_) => libc::EIO,
        };
        -i64::from(code)
    }
}

pub type Result<T> = std::result::Result<T, WgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uapi_errno_is_negative() {
        assert_eq!(UapiError::invalid("listen_port", "x").errno(), -22);
        assert_eq!(UapiError::UnknownOperation("foo=1".into()).errno(), -71);
        assert_eq!(
            UapiError::PortInUse {
                port: 51820,
                source: io::Error::from(io::ErrorKind::AddrInUse),
            }
            .errno(),
            -98
        );
    }

    #[test]
    fn test_device_error_names_stage() {
        let err = DeviceError::InterfaceCreationFailed(io::Error::other("no perm"));
        assert_eq!(err.to_string(), "Failed to create TUN device: no perm");
    }
}
