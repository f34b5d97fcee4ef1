//! Result transforms turn the ordered raw results of an analysis into its aggregate.
//!
//! A transform is pure: it reads the rows it is given and nothing else, so the
//! same rows always produce the same aggregate.

pub mod dimension_slices;
pub mod identity;
pub mod metric_aggregate;

use model::analysis::analysis_status::AnalysisKind;
use model::query::{RawResult, Row};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub use dimension_slices::DimensionSlicesTransform;
pub use identity::IdentityTransform;
pub use metric_aggregate::MetricAggregateTransform;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Expected {expected} query results, got {actual}")]
    QueryCount { expected: usize, actual: usize },

    #[error("Row {row} of query {query} has no column '{column}'")]
    MissingColumn {
        query: usize,
        row: usize,
        column: String,
    },

    #[error("Column '{column}' in row {row} of query {query} is not {expected}: {value}")]
    InvalidValue {
        query: usize,
        row: usize,
        column: String,
        expected: &'static str,
        value: Value,
    },

    #[error("Column '{column}' in row {row} of query {query} overflows the running total")]
    Overflow {
        query: usize,
        row: usize,
        column: String,
    },

    #[error("Failed to serialize aggregate: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait ResultTransform: Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Send;

    fn kind(&self) -> AnalysisKind;

    /// Names of the queries this transform reads, in submission order.
    /// `None` accepts any number of queries.
    fn expected_queries(&self) -> Option<&[&str]> {
        None
    }

    fn transform(&self, results: &[RawResult]) -> Result<Self::Output, TransformError>;

    /// Runs the transform and serializes the aggregate for storage.
    fn apply(&self, results: &[RawResult]) -> Result<Value, TransformError> {
        Ok(serde_json::to_value(self.transform(results)?)?)
    }
}

/// Fails unless exactly `expected` results were handed over.
pub(crate) fn expect_queries(results: &[RawResult], expected: usize) -> Result<(), TransformError> {
    if results.len() != expected {
        return Err(TransformError::QueryCount {
            expected,
            actual: results.len(),
        });
    }
    Ok(())
}

/// Typed access to the columns of one row, with errors naming the row.
pub(crate) struct RowReader<'a> {
    query: usize,
    row: usize,
    columns: &'a Row,
}

impl<'a> RowReader<'a> {
    pub(crate) fn new(query: usize, row: usize, columns: &'a Row) -> Self {
        Self {
            query,
            row,
            columns,
        }
    }

    fn get(&self, column: &str) -> Result<&'a Value, TransformError> {
        self.columns
            .get(column)
            .ok_or_else(|| TransformError::MissingColumn {
                query: self.query,
                row: self.row,
                column: column.to_string(),
            })
    }

    fn invalid(&self, column: &str, expected: &'static str, value: &Value) -> TransformError {
        TransformError::InvalidValue {
            query: self.query,
            row: self.row,
            column: column.to_string(),
            expected,
            value: value.clone(),
        }
    }

    /// Warehouses disagree on numeric types, numbers may arrive as strings.
    pub(crate) fn number(&self, column: &str) -> Result<f64, TransformError> {
        let value = self.get(column)?;
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|n: &f64| n.is_finite())
        .ok_or_else(|| self.invalid(column, "a number", value))
    }

    /// Null reads as `None`, e.g. a `SUM` over no rows.
    pub(crate) fn optional_number(&self, column: &str) -> Result<Option<f64>, TransformError> {
        match self.get(column)? {
            Value::Null => Ok(None),
            _ => self.number(column).map(Some),
        }
    }

    pub(crate) fn overflow(&self, column: &str) -> TransformError {
        TransformError::Overflow {
            query: self.query,
            row: self.row,
            column: column.to_string(),
        }
    }

    /// A non-negative whole number, such as a row or unit count.
    pub(crate) fn count(&self, column: &str) -> Result<u64, TransformError> {
        let n = self.number(column)?;
        if n < 0.0 || n.fract() != 0.0 || n > u64::MAX as f64 {
            return Err(self.invalid(column, "a count", self.get(column)?));
        }
        Ok(n as u64)
    }

    /// Absent and null columns both read as `None`.
    pub(crate) fn optional_label(&self, column: &str) -> Result<Option<String>, TransformError> {
        match self.columns.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(self.invalid(column, "a label", other)),
        }
    }

    pub(crate) fn label(&self, column: &str) -> Result<String, TransformError> {
        let value = self.get(column)?;
        self.optional_label(column)?
            .ok_or_else(|| self.invalid(column, "a label", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn numbers_accept_numeric_strings() {
        let columns = row(json!({ "a": 3, "b": " 2.5 ", "c": "x", "d": null }));
        let reader = RowReader::new(0, 0, &columns);
        assert_eq!(reader.number("a").unwrap(), 3.0);
        assert_eq!(reader.number("b").unwrap(), 2.5);
        assert!(matches!(
            reader.number("c"),
            Err(TransformError::InvalidValue { .. })
        ));
        assert!(matches!(
            reader.number("d"),
            Err(TransformError::InvalidValue { .. })
        ));
        assert!(matches!(
            reader.number("e"),
            Err(TransformError::MissingColumn { .. })
        ));
    }

    #[test]
    fn optional_numbers_read_null_as_none() {
        let columns = row(json!({ "a": null, "b": "4" }));
        let reader = RowReader::new(0, 0, &columns);
        assert_eq!(reader.optional_number("a").unwrap(), None);
        assert_eq!(reader.optional_number("b").unwrap(), Some(4.0));
        assert!(reader.optional_number("c").is_err());
    }

    #[test]
    fn counts_reject_fractions_and_negatives() {
        let columns = row(json!({ "a": "12", "b": 1.5, "c": -1 }));
        let reader = RowReader::new(0, 0, &columns);
        assert_eq!(reader.count("a").unwrap(), 12);
        assert!(reader.count("b").is_err());
        assert!(reader.count("c").is_err());
    }

    #[test]
    fn labels_treat_null_as_missing() {
        let columns = row(json!({ "a": "US", "b": null, "c": 7 }));
        let reader = RowReader::new(0, 0, &columns);
        assert_eq!(reader.label("a").unwrap(), "US");
        assert_eq!(reader.optional_label("b").unwrap(), None);
        assert_eq!(reader.optional_label("z").unwrap(), None);
        assert_eq!(reader.label("c").unwrap(), "7");
        assert!(reader.label("b").is_err());
    }
}
