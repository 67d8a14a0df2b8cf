//! Atomic insert + remove changesets

use serde_json::Value;

use crate::convert::RecordConverter;
use crate::predicate::Predicate;
use crate::{DataError, Row};

/// Insert half of a changeset
#[derive(Debug, Clone, PartialEq)]
pub enum Insert {
    Nothing,
    Rows(Vec<Row>),
}

/// A single mutation batch against one named table
///
/// Removal is evaluated against the rows present before the batch, so rows
/// inserted by the same changeset are never removed by it.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub insert: Insert,
    pub remove: Predicate,
}

/// Counts reported after applying a changeset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub inserted: usize,
    pub removed: usize,
}

impl Changeset {
    /// Remove every row, then insert `rows`
    pub fn replace(rows: Vec<Row>) -> Self {
        Self {
            insert: Insert::Rows(rows),
            remove: Predicate::Everything,
        }
    }

    /// Apply to a table's rows
    pub fn apply(&self, rows: &mut Vec<Row>) -> ChangeSummary {
        let before = rows.len();
        rows.retain(|row| !self.remove.matches(row));
        let removed = before - rows.len();

        let inserted = match &self.insert {
            Insert::Nothing => 0,
            Insert::Rows(new_rows) => {
                rows.extend(new_rows.iter().cloned());
                new_rows.len()
            }
        };

        ChangeSummary { inserted, removed }
    }
}

/// Builds changesets from host payloads
pub struct ChangesetBuilder<'a> {
    converter: &'a RecordConverter,
}

impl<'a> ChangesetBuilder<'a> {
    pub fn new(converter: &'a RecordConverter) -> Self {
        Self { converter }
    }

    /// Build a changeset
    ///
    /// A missing remove payload replaces the whole table; a missing insert
    /// payload inserts nothing. The table itself is not checked here.
    pub fn build(&self, insert: Option<Value>, remove: Option<Value>) -> Result<Changeset, DataError> {
        let insert = match insert {
            None | Some(Value::Null) => Insert::Nothing,
            Some(payload) => Insert::Rows(self.converter.rows(payload)?),
        };
        let remove = self.converter.predicate(remove)?;
        Ok(Changeset { insert, remove })
    }
}
