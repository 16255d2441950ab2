//! Common error types for primitives

use thiserror::Error;

/// Value conversion error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// Value has a different type than requested
    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        /// Requested type
        expected: &'static str,
        /// Actual type
        found: &'static str,
    },

    /// Arithmetic overflowed
    #[error("arithmetic overflow")]
    Overflow,
}
