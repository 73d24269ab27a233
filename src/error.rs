//! Centralized error handling for nbin.
//!
//! Every failure in the engine is reported through [`NbinError`]; the library
//! never panics on malformed input or on a graph it cannot lay out.
//!
//! ## Error Categories
//!
//! - **Type metadata** ([`NbinError::UnsupportedType`], [`NbinError::MissingTypeId`],
//!   [`NbinError::UnresolvedTypeId`], [`NbinError::UnresolvedTypeName`]): the registry
//!   could not derive or find a type.
//! - **Graph shape** ([`NbinError::CannotAllocateValueType`], [`NbinError::MissingLayoutEntry`],
//!   [`NbinError::NullStructElement`], [`NbinError::UnresolvedEnumValue`]): the object graph
//!   does not fit its layout.
//! - **Resources** ([`NbinError::ResourceState`], [`NbinError::Io`]): allocations and files.
//! - **Container format** ([`NbinError::Format`], [`NbinError::UnexpectedEof`]): a file
//!   that is truncated, corrupted, or not an nbin file at all.
//!
//! Transcoding failures are wrapped in [`NbinError::At`], which carries the
//! dotted/bracketed path of the field being processed, e.g.
//! `demo::Scene#nodes[3].transform.scale: ...`.
//!
//! ```rust
//! use nbin::NbinError;
//!
//! fn describe(err: &NbinError) -> String {
//!     match err.root_cause() {
//!         NbinError::Format(msg) => format!("corrupt file: {msg}"),
//!         other => other.to_string(),
//!     }
//! }
//! # let _ = describe(&NbinError::Format("bad magic".into()));
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for nbin operations.
pub type Result<T> = std::result::Result<T, NbinError>;

/// The master error enum covering all failure domains in nbin.
///
/// This type is `Clone`; I/O errors are wrapped in an `Arc`.
#[derive(Debug, Clone)]
pub enum NbinError {
    /// Low-level I/O failure (file not found, mapping failure, disk full...).
    Io(Arc<io::Error>),

    /// A type that cannot be registered on its own: primitives, arrays, an enum
    /// without constants where a default is needed, or a struct that contains
    /// itself inline.
    UnsupportedType(String),

    /// The external type-id function returned nothing for the named type.
    MissingTypeId(String),

    /// No descriptor with this type id exists in the registry.
    UnresolvedTypeId(i32),

    /// No live type with this name is known to the catalog.
    UnresolvedTypeName(String),

    /// A stored enum integer matches none of the constants of its type.
    UnresolvedEnumValue {
        /// Name of the enum type.
        type_name: String,
        /// The integer read from memory.
        value: i32,
    },

    /// A primitive, enum or struct was offered as a standalone layout entry.
    CannotAllocateValueType(String),

    /// A referenced instance has no entry in the layout or any parent layout.
    /// This means the layout was not planned from the same graph.
    MissingLayoutEntry(String),

    /// A slot of a struct array is empty.
    NullStructElement,

    /// An operation is not allowed in the current resource state: releasing an
    /// instance set with open children, touching a released allocation,
    /// writing to a read-only mapping.
    ResourceState(String),

    /// The byte stream does not follow the container format (wrong magic,
    /// inconsistent tables, out-of-bounds slice).
    Format(String),

    /// The input ended before a declared table or region was complete.
    UnexpectedEof(String),

    /// A broken internal invariant. Please report it.
    Internal(String),

    /// A transcoding failure, wrapped with the path of the field being processed.
    At {
        /// Human-readable location, e.g. `Type#field[2].inner`.
        path: String,
        /// The failure at that location.
        source: Box<NbinError>,
    },
}

impl NbinError {
    /// Wraps `self` with a field path, unless it already carries one.
    ///
    /// The innermost path is the most precise, so an error that already went
    /// through [`NbinError::At`] is returned unchanged.
    pub fn at(self, path: impl fmt::Display) -> Self {
        match self {
            Self::At { .. } => self,
            other => Self::At {
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the error with all path wrappers removed.
    pub fn root_cause(&self) -> &NbinError {
        match self {
            Self::At { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns the field path attached to this error, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::At { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for NbinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O Error: {e}"),
            Self::UnsupportedType(s) => write!(f, "Unsupported type: {s}"),
            Self::MissingTypeId(s) => write!(f, "No type id for type {s}"),
            Self::UnresolvedTypeId(id) => write!(f, "Unresolved type id {id}"),
            Self::UnresolvedTypeName(s) => write!(f, "Unresolved type name {s}"),
            Self::UnresolvedEnumValue { type_name, value } => {
                write!(f, "Unresolved enum {type_name} for value {value}")
            }
            Self::CannotAllocateValueType(s) => write!(f, "Can not allocate value type {s}"),
            Self::MissingLayoutEntry(s) => write!(f, "No layout entry for {s}"),
            Self::NullStructElement => write!(f, "Struct array element can not be null"),
            Self::ResourceState(s) => write!(f, "Invalid resource state: {s}"),
            Self::Format(s) => write!(f, "Format Error: {s}"),
            Self::UnexpectedEof(s) => write!(f, "Unexpected end of data: {s}"),
            Self::Internal(s) => write!(f, "Internal Logic Error: {s}"),
            Self::At { path, source } => write!(f, "{path}: {source}"),
        }
    }
}

impl std::error::Error for NbinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::At { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for NbinError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Self::UnexpectedEof(err.to_string());
        }
        Self::Io(Arc::new(err))
    }
}
