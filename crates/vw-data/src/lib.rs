//! Data handling for the view bridge
//!
//! Everything in this crate is pure: payload conversion from host tables into
//! row records, the remove-predicate expression language and the changeset
//! descriptors applied to a view's named data tables.

pub mod changeset;
pub mod convert;
pub mod predicate;

use arrow::error::ArrowError;
use thiserror::Error;

// Re-exports
pub use changeset::{ChangeSummary, Changeset, ChangesetBuilder, Insert};
pub use convert::{Converted, ConverterOptions, RecordConverter};
pub use predicate::{BinaryOp, Expr, Predicate};

/// A single row record, as handed to the view
pub type Row = serde_json::Value;

/// Errors that can occur while shaping payloads
#[derive(Error, Debug)]
pub enum DataError {
    #[error("column '{column}' has {found} values, expected {expected}")]
    RaggedColumns {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("table mixes array and scalar columns (column '{0}')")]
    NotColumnar(String),

    #[error("string predicates are disabled for this bridge")]
    UntrustedPredicate,

    #[error("predicate parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("expected row records, got {0}")]
    ExpectedRows(&'static str),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
