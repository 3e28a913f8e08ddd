use core::fmt;
use std::rc::Rc;

pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by lookups and the resolver.
///
/// The type is `Clone` because a single failed batch fans out to every
/// caller queued on it; shared payloads are reference-counted so the
/// fan-out stays cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A required lookup completed, but the bulk fetch did not return a
    /// value for the requested key.
    KeyNotFound {
        /// The missing key, rendered with its `Debug` representation.
        key: String,
        /// The type name of the value that was being looked up.
        value_type: &'static str,
    },
    /// The user-supplied bulk fetch returned an error while a batch was
    /// being flushed.
    Bulk(Rc<str>),
    /// An immediate scope was ended while it was not the innermost open
    /// scope.
    ScopeMisuse,
    /// A caller-defined error, typically produced by a not-found
    /// factory installed with
    /// [`BatchLookup::with_not_found`](crate::BatchLookup::with_not_found).
    Custom(Rc<str>),
}

impl Error {
    /// Constructs a [`Error::Bulk`] from any displayable message.
    pub fn bulk(message: impl Into<Rc<str>>) -> Self {
        Error::Bulk(message.into())
    }

    /// Constructs a [`Error::Custom`] from any displayable message.
    pub fn custom(message: impl Into<Rc<str>>) -> Self {
        Error::Custom(message.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KeyNotFound { key, value_type } => {
                write!(f, "no {value_type} was fetched for key {key}")
            }
            Error::Bulk(msg) => write!(f, "bulk fetch failed: {msg}"),
            Error::ScopeMisuse => write!(f, "immediate scope ended out of LIFO order"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl core::error::Error for Error {}
