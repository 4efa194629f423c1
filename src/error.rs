use std::fmt;
use std::io;

/// Status of a finished or failed operation.
///
/// Codes cover three classes: errno-style OS failures, conditions detected
/// by the library itself (e.g. [`StatusCode::FileNotOpen`]) and TLS
/// handshake material problems. Every code renders a human description via
/// [`fmt::Display`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum StatusCode {
    #[error("no error")]
    Ok,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("socket is not connected")]
    NotConnected,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("connection already in progress")]
    ConnectionAlreadyInProgress,
    #[error("address already in use")]
    AddressAlreadyInUse,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("permission denied")]
    PermissionDenied,
    #[error("message too long")]
    MessageTooLong,
    #[error("end of file")]
    EndOfFile,
    #[error("no such file or directory")]
    NoSuchFileOrDirectory,
    #[error("file or directory already exists")]
    FileOrDirAlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("illegal operation on a directory")]
    IllegalOperationOnADirectory,
    #[error("name too long")]
    NameTooLong,
    #[error("operation already in progress")]
    OperationAlreadyInProgress,
    #[error("operation canceled")]
    OperationCanceled,
    #[error("operation on closed socket")]
    OperationOnClosedSocket,
    #[error("file is not open")]
    FileNotOpen,
    #[error("directory is not open")]
    DirNotOpen,
    #[error("out of memory")]
    OutOfMemory,
    #[error("unknown node or service")]
    UnknownNodeOrService,
    #[error("TLS certificate file does not exist")]
    TlsCertificateFileNotExist,
    #[error("TLS private key file does not exist")]
    TlsPrivateKeyFileNotExist,
    #[error("TLS certificate is invalid")]
    TlsCertificateInvalid,
    #[error("TLS private key is invalid")]
    TlsPrivateKeyInvalid,
    #[error("TLS private key and certificate do not match")]
    TlsPrivateKeyAndCertificateNotMatch,
    #[error("OpenSSL error")]
    OpensslError,
    #[error("undefined error")]
    Undefined,
}

impl StatusCode {
    /// Maps an OS-level error to the closest status code.
    ///
    /// Raw errno values are consulted for conditions `io::ErrorKind` does
    /// not distinguish on the supported toolchain.
    pub fn from_io_error(err: &io::Error) -> StatusCode {
        if let Some(raw) = err.raw_os_error() {
            match raw {
                libc::EINVAL => return StatusCode::InvalidArgument,
                libc::ENOTCONN => return StatusCode::NotConnected,
                libc::ECONNREFUSED => return StatusCode::ConnectionRefused,
                libc::ECONNRESET | libc::EPIPE => return StatusCode::ConnectionResetByPeer,
                libc::EALREADY => return StatusCode::ConnectionAlreadyInProgress,
                libc::EADDRINUSE => return StatusCode::AddressAlreadyInUse,
                libc::EADDRNOTAVAIL => return StatusCode::AddressNotAvailable,
                libc::EACCES | libc::EPERM => return StatusCode::PermissionDenied,
                libc::EMSGSIZE => return StatusCode::MessageTooLong,
                libc::ENOENT => return StatusCode::NoSuchFileOrDirectory,
                libc::EEXIST => return StatusCode::FileOrDirAlreadyExists,
                libc::ENOTDIR => return StatusCode::NotADirectory,
                libc::EISDIR => return StatusCode::IllegalOperationOnADirectory,
                libc::ENAMETOOLONG => return StatusCode::NameTooLong,
                libc::EINPROGRESS => return StatusCode::OperationAlreadyInProgress,
                libc::ECANCELED => return StatusCode::OperationCanceled,
                libc::EBADF => return StatusCode::OperationOnClosedSocket,
                libc::ENOMEM => return StatusCode::OutOfMemory,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::InvalidInput => StatusCode::InvalidArgument,
            io::ErrorKind::NotConnected => StatusCode::NotConnected,
            io::ErrorKind::ConnectionRefused => StatusCode::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                StatusCode::ConnectionResetByPeer
            }
            io::ErrorKind::AddrInUse => StatusCode::AddressAlreadyInUse,
            io::ErrorKind::AddrNotAvailable => StatusCode::AddressNotAvailable,
            io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            io::ErrorKind::NotFound => StatusCode::NoSuchFileOrDirectory,
            io::ErrorKind::AlreadyExists => StatusCode::FileOrDirAlreadyExists,
            io::ErrorKind::UnexpectedEof => StatusCode::EndOfFile,
            io::ErrorKind::OutOfMemory => StatusCode::OutOfMemory,
            _ => StatusCode::Undefined,
        }
    }
}

/// Outcome of an operation: a [`StatusCode`] plus an optional context
/// string naming the offending resource.
///
/// `Error` is a value type. Asynchronous operations always deliver one to
/// their callback; `error.is_ok()` distinguishes success. Equality compares
/// codes only, so `error == StatusCode::Ok` style checks work regardless of
/// context.
#[derive(Clone, Debug, Default)]
pub struct Error {
    code: StatusCode,
    context: Option<String>,
}

impl Default for StatusCode {
    fn default() -> StatusCode {
        StatusCode::Ok
    }
}

impl Error {
    pub fn new(code: StatusCode) -> Error {
        Error {
            code,
            context: None,
        }
    }

    pub fn with_context(code: StatusCode, context: impl Into<String>) -> Error {
        Error {
            code,
            context: Some(context.into()),
        }
    }

    pub fn ok() -> Error {
        Error::new(StatusCode::Ok)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// Context string describing the offending resource, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.code == other.code
    }
}

impl Eq for Error {}

impl PartialEq<StatusCode> for Error {
    fn eq(&self, other: &StatusCode) -> bool {
        self.code == *other
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{}: {}", self.code, context),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Error {}

impl From<StatusCode> for Error {
    fn from(code: StatusCode) -> Error {
        Error::new(code)
    }
}

impl From<&io::Error> for Error {
    fn from(err: &io::Error) -> Error {
        Error::new(StatusCode::from_io_error(err))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_has_a_description() {
        let codes = [
            StatusCode::Ok,
            StatusCode::InvalidArgument,
            StatusCode::NotConnected,
            StatusCode::ConnectionRefused,
            StatusCode::ConnectionResetByPeer,
            StatusCode::ConnectionAlreadyInProgress,
            StatusCode::AddressAlreadyInUse,
            StatusCode::AddressNotAvailable,
            StatusCode::PermissionDenied,
            StatusCode::MessageTooLong,
            StatusCode::EndOfFile,
            StatusCode::NoSuchFileOrDirectory,
            StatusCode::FileOrDirAlreadyExists,
            StatusCode::NotADirectory,
            StatusCode::IllegalOperationOnADirectory,
            StatusCode::NameTooLong,
            StatusCode::OperationAlreadyInProgress,
            StatusCode::OperationCanceled,
            StatusCode::OperationOnClosedSocket,
            StatusCode::FileNotOpen,
            StatusCode::DirNotOpen,
            StatusCode::OutOfMemory,
            StatusCode::UnknownNodeOrService,
            StatusCode::TlsCertificateFileNotExist,
            StatusCode::TlsPrivateKeyFileNotExist,
            StatusCode::TlsCertificateInvalid,
            StatusCode::TlsPrivateKeyInvalid,
            StatusCode::TlsPrivateKeyAndCertificateNotMatch,
            StatusCode::OpensslError,
            StatusCode::Undefined,
        ];
        for code in codes {
            assert!(!code.to_string().is_empty());
        }
    }

    #[test]
    fn errno_mapping() {
        let err = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert_eq!(StatusCode::from_io_error(&err), StatusCode::ConnectionRefused);

        let err = io::Error::from_raw_os_error(libc::EMSGSIZE);
        assert_eq!(StatusCode::from_io_error(&err), StatusCode::MessageTooLong);
    }

    #[test]
    fn context_is_carried() {
        let err = Error::with_context(StatusCode::NoSuchFileOrDirectory, "/no/such/path");
        assert_eq!(err.code(), StatusCode::NoSuchFileOrDirectory);
        assert_eq!(err.context(), Some("/no/such/path"));
        assert_eq!(err, Error::new(StatusCode::NoSuchFileOrDirectory));
    }
}
