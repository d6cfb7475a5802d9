//! Error types for the git-tablet crate.
//!
//! A single `GitError` enumeration is shared by the object codec, the pack
//! and delta decoders, the tablet storage engine, and the transport client.
//! Every variant maps onto one of the coarse `ErrorKind` classes that the
//! HTTP layer translates into status codes and side-band errors.

use thiserror::Error;

/// Coarse classification of a failure, used to pick protocol-level behavior
/// (HTTP status, side-band channel 3, retry policy).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedInput,
    Corruption,
    NotFound,
    Conflict,
    Permission,
    Capacity,
    Timeout,
    Transient,
    Fatal,
}

#[derive(Error, Debug)]
/// Unified error enumeration for the git-tablet library.
pub enum GitError {
    /// Bad pkt-line framing (length field, short read, oversized frame).
    #[error("Malformed pkt-line: {0}")]
    MalformedPktLine(String),

    /// A hash that is not 40 lowercase hex characters.
    #[error("The `{0}` is not a valid object hash.")]
    InvalidHashValue(String),

    /// Invalid or unsupported git object type name or code.
    #[error("The `{0}` is not a valid git object type.")]
    InvalidObjectType(String),

    /// Malformed blob/tree/commit/tag payload.
    #[error("Not a valid git {kind} object: {msg}")]
    InvalidObject { kind: &'static str, msg: String },

    /// Invalid pack header magic, version or truncated header.
    #[error("The `{0}` is not a valid pack header.")]
    InvalidPackHeader(String),

    /// Malformed or truncated pack body.
    #[error("The `{0}` is not a valid pack file.")]
    InvalidPackFile(String),

    /// Malformed or unsupported pack index.
    #[error("The `{0}` is not a valid pack index.")]
    InvalidPackIndex(String),

    /// Delta stream violation (opcode 0, out-of-range copy, bad varint).
    #[error("Delta error: {0}")]
    InvalidDelta(String),

    /// Stored data fails an integrity check (trailer mismatch, size
    /// mismatch after delta application, unknown type tag in a tablet).
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// A tablet row declared `external` whose bucket object is gone.
    #[error("Dangling external reference for object {0}")]
    DanglingExternal(String),

    /// Object missing from buffer, tablets, and chunk index.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Ref name does not exist.
    #[error("Ref not found: {0}")]
    RefNotFound(String),

    /// An abbreviated hash matched more than one object.
    #[error("Prefix `{0}` is ambiguous")]
    AmbiguousPrefix(String),

    /// Compare-and-swap on a ref observed a different prior value.
    #[error("Ref update conflict on {name}: expected {expected}, found {actual}")]
    CasConflict {
        name: String,
        expected: String,
        actual: String,
    },

    /// Push command is not a fast-forward.
    #[error("Non-fast-forward update of {0}")]
    NonFastForward(String),

    /// The policy oracle denied the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A configured session cap or rate limit was breached.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Session deadline elapsed.
    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    /// Retriable failure of the object storage provider.
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// Invariant violation; the enclosing operation must abort.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Text encoding or UTF-8 conversion error.
    #[error("UTF-8 conversion error: {0}")]
    Conversion(String),

    /// I/O error from an underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// SQL storage error.
    #[error("Database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

impl GitError {
    /// Map the variant onto its coarse class.
    pub fn kind(&self) -> ErrorKind {
        use GitError::*;
        match self {
            MalformedPktLine(_)
            | InvalidHashValue(_)
            | InvalidObjectType(_)
            | InvalidObject { .. }
            | InvalidPackHeader(_)
            | InvalidPackFile(_)
            | InvalidPackIndex(_)
            | InvalidDelta(_)
            | Conversion(_) => ErrorKind::MalformedInput,
            Corruption(_) | DanglingExternal(_) => ErrorKind::Corruption,
            ObjectNotFound(_) | RefNotFound(_) | AmbiguousPrefix(_) => ErrorKind::NotFound,
            CasConflict { .. } | NonFastForward(_) => ErrorKind::Conflict,
            PermissionDenied(_) => ErrorKind::Permission,
            CapacityExceeded(_) => ErrorKind::Capacity,
            Timeout(_) => ErrorKind::Timeout,
            Transient(_) | Db(_) | IOError(_) => ErrorKind::Transient,
            Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Variants should classify into the expected coarse kinds.
    #[test]
    fn kind_classification() {
        assert_eq!(
            GitError::MalformedPktLine("x".into()).kind(),
            ErrorKind::MalformedInput
        );
        assert_eq!(
            GitError::Corruption("trailer".into()).kind(),
            ErrorKind::Corruption
        );
        assert_eq!(
            GitError::ObjectNotFound("abcd".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            GitError::Timeout("session".into()).kind(),
            ErrorKind::Timeout
        );
    }

    /// Only transient errors are retriable.
    #[test]
    fn retriable_is_transient_only() {
        assert!(GitError::Transient("503".into()).is_retriable());
        assert!(!GitError::Fatal("invariant".into()).is_retriable());
    }
}
