use thiserror::Error;

macro_rules! weave_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants follow the transformation's error taxonomy: configuration errors abort before
/// any scanning happens, pattern compilation errors abort artifact generation for the whole
/// batch, and unsupported merge constructs abort the merge. Detection skips are *not* errors
/// and are reported through the log channel instead (see [`crate::locator::LocateError`]).
#[derive(Error, Debug)]
pub enum Error {
    /// The in-memory module representation is internally inconsistent.
    ///
    /// This covers dangling instruction references, out-of-range member
    /// indices and similar structural damage. The error includes the source
    /// location where the inconsistency was detected for debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The weaver configuration contains an unknown key or value.
    ///
    /// The message names the offending key/value and the allowed set. Reported
    /// before any scanning begins; nothing is modified.
    #[error("Configuration is invalid: {0}")]
    Configuration(String),

    /// A literal regex pattern failed to compile.
    ///
    /// The external artifact compiler processes all patterns together and can
    /// fail atomically; each pattern is re-validated in isolation so the error
    /// can name the specific pattern that does not parse.
    #[error("Regular expression {definition} is invalid: {message}")]
    PatternCompile {
        /// The rendered pattern and options that failed
        definition: String,
        /// The underlying compiler message
        message: String,
    },

    /// The artifact module uses a construct the merge engine does not model.
    ///
    /// Events, properties, nested types, generic parameters, P/Invoke,
    /// security declarations and parameter marshaling are deliberately
    /// unsupported. The merge aborts; no partial merge is committed.
    #[error("Cannot merge unsupported construct: {0}")]
    MergeUnsupported(&'static str),

    /// The external artifact compiler failed for a reason other than an
    /// invalid pattern.
    #[error("Artifact compilation failed: {0}")]
    ArtifactCompile(String),

    /// File I/O error while probing, deleting or handing off the artifact file.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
