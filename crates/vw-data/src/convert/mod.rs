//! Payload conversion from host tables into view row records

use arrow::json::ArrayWriter;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::predicate::{truthy, Predicate};
use crate::{DataError, Row};

/// Options controlling how payloads are interpreted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterOptions {
    /// Accept serialized predicate expressions from the host.
    ///
    /// Only enable for same-origin hosts; the expression is parsed and
    /// evaluated, never executed, but it still lets the sender pick rows.
    pub trust_string_predicates: bool,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self {
            trust_string_predicates: true,
        }
    }
}

/// Result of converting a host payload
#[derive(Debug, Clone, PartialEq)]
pub enum Converted {
    Rows(Vec<Row>),
    Predicate(Predicate),
}

/// Converts host-native payloads into the shapes the view consumes
#[derive(Debug, Clone, Default)]
pub struct RecordConverter {
    options: ConverterOptions,
}

impl RecordConverter {
    /// Create a converter with the given options
    pub fn new(options: ConverterOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConverterOptions {
        &self.options
    }

    /// Convert a payload
    ///
    /// Strings become predicates, column tables are transposed into rows and
    /// anything else is already row-oriented and passes through.
    pub fn convert(&self, payload: Value) -> Result<Converted, DataError> {
        match payload {
            Value::String(source) => {
                if !self.options.trust_string_predicates {
                    return Err(DataError::UntrustedPredicate);
                }
                Predicate::parse(&source).map(Converted::Predicate)
            }
            Value::Object(table) => columns_to_rows(table).map(Converted::Rows),
            Value::Array(rows) => Ok(Converted::Rows(rows)),
            Value::Null => Ok(Converted::Rows(Vec::new())),
            single => Ok(Converted::Rows(vec![single])),
        }
    }

    /// Convert a payload that must describe rows (insert side)
    pub fn rows(&self, payload: Value) -> Result<Vec<Row>, DataError> {
        match self.convert(payload)? {
            Converted::Rows(rows) => Ok(rows),
            Converted::Predicate(_) => Err(DataError::ExpectedRows("a predicate expression")),
        }
    }

    /// Convert a payload describing which rows to remove
    ///
    /// A missing or falsy payload (`null`, `false`, `0`, `""`) selects every
    /// row, and so does `true`.
    pub fn predicate(&self, payload: Option<Value>) -> Result<Predicate, DataError> {
        match payload {
            None => Ok(Predicate::Everything),
            Some(Value::Bool(true)) => Ok(Predicate::Everything),
            Some(payload) if !truthy(&payload) => Ok(Predicate::Everything),
            Some(payload) => Ok(match self.convert(payload)? {
                Converted::Predicate(predicate) => predicate,
                Converted::Rows(rows) => Predicate::Rows(rows),
            }),
        }
    }
}

/// Transpose a column table (`{column: [values]}`) into row records
///
/// An object without any array values is a single record already and is
/// wrapped rather than transposed.
pub fn columns_to_rows(table: Map<String, Value>) -> Result<Vec<Row>, DataError> {
    if !table.is_empty() && !table.values().any(Value::is_array) {
        return Ok(vec![Value::Object(table)]);
    }

    let mut columns: Vec<(String, Vec<Value>)> = Vec::with_capacity(table.len());
    for (name, values) in table {
        match values {
            Value::Array(values) => columns.push((name, values)),
            _ => return Err(DataError::NotColumnar(name)),
        }
    }

    let expected = columns.first().map(|(_, values)| values.len()).unwrap_or(0);
    if let Some((name, values)) = columns.iter().find(|(_, values)| values.len() != expected) {
        return Err(DataError::RaggedColumns {
            column: name.clone(),
            expected,
            found: values.len(),
        });
    }

    let mut rows: Vec<Map<String, Value>> = (0..expected).map(|_| Map::new()).collect();
    for (name, values) in columns {
        for (row, value) in rows.iter_mut().zip(values) {
            row.insert(name.clone(), value);
        }
    }

    Ok(rows.into_iter().map(Value::Object).collect())
}

/// Convert an Arrow record batch into row records
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>, DataError> {
    let mut writer = ArrayWriter::new(Vec::new());
    writer.write_batches(&[batch])?;
    writer.finish()?;
    let buffer = writer.into_inner();

    tracing::debug!(rows = batch.num_rows(), bytes = buffer.len(), "converted record batch");

    Ok(serde_json::from_slice(&buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_column_table_is_transposed() {
        let converter = RecordConverter::default();
        let converted = converter
            .convert(json!({"x": [1, 2], "y": ["a", "b"]}))
            .unwrap();
        assert_eq!(
            converted,
            Converted::Rows(vec![json!({"x": 1, "y": "a"}), json!({"x": 2, "y": "b"})])
        );
    }

    #[test]
    fn test_column_order_is_preserved() {
        let rows = columns_to_rows(json!({"z": [1], "a": [2]}).as_object().unwrap().clone()).unwrap();
        let keys: Vec<_> = rows[0].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn test_row_payload_is_unchanged() {
        let converter = RecordConverter::default();
        let rows = json!([{"x": 1, "y": 2}]);
        let once = converter.convert(rows.clone()).unwrap();
        assert_eq!(once, Converted::Rows(vec![json!({"x": 1, "y": 2})]));

        let Converted::Rows(once_rows) = once.clone() else {
            panic!("expected rows");
        };
        let twice = converter.convert(Value::Array(once_rows)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_ragged_columns_rejected() {
        let err = RecordConverter::default()
            .convert(json!({"x": [1, 2], "y": [1]}))
            .unwrap_err();
        assert!(matches!(err, DataError::RaggedColumns { expected: 2, found: 1, .. }));
    }

    #[test]
    fn test_single_record_object_is_wrapped() {
        let rows = RecordConverter::default().rows(json!({"x": 1})).unwrap();
        assert_eq!(rows, vec![json!({"x": 1})]);
    }

    #[test]
    fn test_string_becomes_predicate() {
        let converted = RecordConverter::default().convert(json!("datum.x > 1")).unwrap();
        assert!(matches!(converted, Converted::Predicate(Predicate::Expr(_))));
    }

    #[test]
    fn test_untrusted_strings_rejected() {
        let converter = RecordConverter::new(ConverterOptions {
            trust_string_predicates: false,
        });
        assert!(matches!(
            converter.convert(json!("datum.x > 1")),
            Err(DataError::UntrustedPredicate)
        ));
    }

    #[test]
    fn test_predicate_defaults_to_everything() {
        let converter = RecordConverter::default();
        assert_eq!(converter.predicate(None).unwrap(), Predicate::Everything);
        assert_eq!(converter.predicate(Some(Value::Null)).unwrap(), Predicate::Everything);
        assert_eq!(
            converter.predicate(Some(json!([{"x": 1}]))).unwrap(),
            Predicate::Rows(vec![json!({"x": 1})])
        );
    }

    #[test]
    fn test_falsy_predicates_select_everything() {
        let converter = RecordConverter::default();
        for payload in [json!(false), json!(0), json!(0.0), json!("")] {
            assert_eq!(converter.predicate(Some(payload)).unwrap(), Predicate::Everything);
        }
        // Falsy payloads never reach the string gate
        let untrusting = RecordConverter::new(ConverterOptions {
            trust_string_predicates: false,
        });
        assert_eq!(untrusting.predicate(Some(json!(""))).unwrap(), Predicate::Everything);

        // An empty array is truthy and selects nothing
        assert_eq!(converter.predicate(Some(json!([]))).unwrap(), Predicate::Rows(Vec::new()));
        assert_eq!(converter.predicate(Some(json!(3))).unwrap(), Predicate::Rows(vec![json!(3)]));
    }

    #[test]
    fn test_insert_rejects_predicate_strings() {
        assert!(RecordConverter::default().rows(json!("datum.x")).is_err());
    }

    #[test]
    fn test_record_batch_to_rows() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Float64, false),
            Field::new("label", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(vec![1.5, 2.5])),
                Arc::new(StringArray::from(vec!["a", "b"])),
            ],
        )
        .unwrap();

        let rows = batch_to_rows(&batch).unwrap();
        assert_eq!(rows, vec![json!({"x": 1.5, "label": "a"}), json!({"x": 2.5, "label": "b"})]);
    }
}
