//! Typed errors at each component boundary, see `spec.md` section 7.
//!
//! Library code returns one of these from the operation where the condition
//! is detected; only process-level bootstrap (the demo binary) collapses
//! everything into an [`eyre::Report`].

use ten_runtime_protocol::Loc;

/// A path, property, or schema failure detected while assembling or routing a value.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("path segment {0:?} does not address a container")]
    NotAContainer(String),

    #[error("array index {0} is negative or otherwise malformed")]
    InvalidIndex(String),

    #[error("array index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("no value at path {0:?}")]
    NotFound(String),

    #[error("empty path")]
    EmptyPath,
}

/// Failure validating a value against a [`crate::schema::Schema`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("missing required field {0:?}")]
    MissingRequired(String),

    #[error("field {field:?} has the wrong type, expected {expected}")]
    WrongType { field: String, expected: &'static str },
}

/// Failure from the addon registry, see `spec.md` section 4.2.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AddonError {
    #[error("an addon named {0:?} is already registered for this kind")]
    DuplicateName(String),

    #[error("no addon named {0:?} is registered for this kind")]
    UnknownAddon(String),
}

/// Failure starting or routing within a graph instance, see `spec.md` section 4.6.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("graph references unknown addon {0:?}")]
    UnknownAddon(String),

    #[error("graph declares extension {0:?} more than once")]
    DuplicateExtension(String),

    #[error("connection references unresolved destination {0}")]
    UnresolvedDestination(Loc),

    #[error("no graph instance with id {0:?} is running")]
    GraphNotFound(String),
}

/// Failure sending a message out of an extension, see `spec.md` section 4.4.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SendError {
    #[error("message rejected by schema: {0}")]
    SchemaViolation(#[from] SchemaError),

    #[error("extension is stopping or stopped, send rejected")]
    ClosingInProgress,

    #[error("message has no resolved destination")]
    NoDestination,
}

/// Failure converting between a [`crate::message::Message`] and the wire
/// envelope a [`crate::remote::Protocol`] puts on the transport, see
/// `spec.md` section 6.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum WireError {
    #[error("a Cmd or CmdResult envelope is missing its cmd_id")]
    MissingCmdId,

    #[error("malformed line: {0}")]
    Malformed(String),
}
