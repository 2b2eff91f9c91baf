use thiserror::Error;

/// Returned when the value behind an empty [`Strong`][crate::Strong] is requested.
///
/// Dereferencing an empty handle through [`Deref`][std::ops::Deref] panics with this error's
/// message instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[error("null dereference of an empty strong handle")]
pub struct NullDereference;
