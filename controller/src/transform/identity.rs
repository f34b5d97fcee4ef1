use crate::transform::{ResultTransform, TransformError};
use model::analysis::analysis_status::AnalysisKind;
use model::query::RawResult;
use serde_json::Value;

/// Passes rows through: a single row becomes that row's object, anything else
/// an array of rows. Several queries produce an array with one entry per query.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityTransform;

fn unwrap_rows(result: &RawResult) -> Value {
    match result.rows.as_slice() {
        [row] => Value::Object(row.clone()),
        rows => Value::Array(rows.iter().cloned().map(Value::Object).collect()),
    }
}

impl ResultTransform for IdentityTransform {
    type Output = Value;

    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Custom
    }

    fn transform(&self, results: &[RawResult]) -> Result<Value, TransformError> {
        Ok(match results {
            [single] => unwrap_rows(single),
            many => Value::Array(many.iter().map(unwrap_rows).collect()),
        })
    }
}
