//! Error types for key parsing and binding decoding.

use thiserror::Error;

/// Errors that can occur when parsing an [`ObjectKey`](crate::ObjectKey).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key string is empty.
    #[error("object key cannot be empty")]
    Empty,

    /// The key is missing the `/` separator.
    #[error("object key missing '/' separator: {0}")]
    MissingSeparator(String),

    /// One of the segments is empty.
    #[error("object key has an empty segment: {0}")]
    EmptySegment(String),
}

/// Errors that can occur when deriving routing data from a source entity.
///
/// Every variant describes malformed input: retrying cannot fix it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// The binding label is absent.
    #[error("missing label {label}")]
    MissingLabel { label: String },

    /// The binding label is not `<namespace>.<name>`.
    #[error("label {label}={value} is not in <namespace>.<name> form")]
    MalformedLabel { label: String, value: String },

    /// The port override annotation is not a base-10 port number.
    #[error("annotation {annotation}={value} is not a valid port number")]
    InvalidPortAnnotation { annotation: String, value: String },

    /// No override annotation and no declared ports.
    #[error("service declares no ports")]
    NoPorts,

    /// The first declared port is outside 1..=65535.
    #[error("declared port {0} is out of range")]
    PortOutOfRange(i32),
}
