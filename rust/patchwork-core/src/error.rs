//! Errors raised while registering parameter domains and variants.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A bool or enum axis appears before a type axis.
    #[error("malformed axis order: non-type axis at position {position} precedes a type axis")]
    MalformedAxisOrder { position: usize },

    #[error("duplicate parameter tuple {tuple:?} in family `{family}`")]
    DuplicateTuple { family: String, tuple: Vec<u64> },

    #[error("family `{family}` expects {expected} parameters, got {found}")]
    ParameterCountMismatch {
        family: String,
        expected: usize,
        found: usize,
    },

    #[error("unknown type name `{0}`")]
    UnknownTypeName(String),

    #[error("type axis at position {position} lists `{ty}` more than once")]
    DuplicateDomainMember { position: usize, ty: String },

    #[error("placeholder `{0}` has a malformed ordinal")]
    BadPlaceholderOrdinal(String),
}
