use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        $crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

pub(crate) use malformed_error;

/// The generic Error type covering every failure this library can surface.
///
/// Non-fatal conditions are always explicit in return types; broken internal
/// invariants (negative spill counts, missing predecessor blocks, the register
/// allocator's reiteration cap) are programmer errors and abort via assertions
/// instead of appearing here.
#[derive(Error, Debug)]
pub enum Error {
    /// The input container is damaged and could not be parsed.
    ///
    /// Includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error was detected
        file: &'static str,
        /// The source line in which this error was detected
        line: u32,
    },

    /// An out of bound access was attempted while parsing the input.
    #[error("Out of bound read would have occurred")]
    OutOfBounds,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// This file or feature is not supported.
    #[error("This file type is not supported")]
    NotSupported,

    /// The OAT container does not start with the `oat\n` magic.
    #[error("Bad OAT magic number")]
    BadMagic,

    /// The OAT container carries a version this codec does not know.
    ///
    /// The raw version word is preserved so callers can still report it.
    #[error("Unknown OAT version 0x{0:08x}")]
    UnknownVersion(u32),

    /// Re-keying a type, field or method would clash with an existing handle.
    ///
    /// Returned by `alias_type_name`, `mutate_field` and `mutate_method`;
    /// callers may retry with `rename_on_collision` or skip the rename.
    #[error("Name collision on {0}")]
    NameCollision(String),

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Failed to lock a shared structure.
    #[error("Failed to lock target")]
    LockError,

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}

/// Alias for `Result` with this crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
