//! Test utilities and proptest strategies for model types.
//!
//! This module is only available when the `testing` feature is enabled.

use crate::analysis::analysis_status::{AnalysisKind, AnalysisStatus};
use crate::analysis::{AnalysisId, CreateAnalysis};
use crate::error::{ErrorKind, RecordError};
use crate::query::{CreateQueryRecord, QueryOutcome, RawResult, Row};
use proptest::prelude::*;
use serde_json::{Value, json};

/// Strategy for target keys shaped like the ones analyses use in practice.
pub fn arb_target_key() -> impl Strategy<Value = String> {
    (
        proptest::string::string_regex("[a-z][a-z0-9_]{2,14}").unwrap(),
        proptest::string::string_regex("ds_[a-z0-9]{4,10}").unwrap(),
        proptest::string::string_regex("[a-z][a-z0-9_]{2,14}").unwrap(),
    )
        .prop_map(|(kind, datasource, target)| format!("{kind}:{datasource}:{target}"))
}

prop_compose! {
    /// Strategy for generating CreateAnalysis requests.
    pub fn arb_create_analysis()(
        target_key in arb_target_key(),
        kind in any::<AnalysisKind>(),
        lookback_days in 1..365u32,
    ) -> CreateAnalysis {
        CreateAnalysis::new(target_key)
            .kind(kind)
            .params(json!({ "lookbackDays": lookback_days }))
    }
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        (-1.0e6..1.0e6f64).prop_map(Value::from),
        proptest::string::string_regex("[a-zA-Z0-9 ]{0,12}")
            .unwrap()
            .prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        Just(Value::Null),
    ]
}

/// Strategy for a single warehouse row with 1..5 columns.
pub fn arb_row() -> impl Strategy<Value = Row> {
    prop::collection::btree_map(
        proptest::string::string_regex("[a-z][a-z0-9_]{0,11}").unwrap(),
        arb_value(),
        1..5,
    )
    .prop_map(|columns| columns.into_iter().collect())
}

/// Strategy for a raw row set of 0..20 rows.
pub fn arb_raw_result() -> impl Strategy<Value = RawResult> {
    prop::collection::vec(arb_row(), 0..20).prop_map(RawResult::new)
}

prop_compose! {
    pub fn arb_record_error()(
        kind in any::<ErrorKind>(),
        message in proptest::string::string_regex("[a-zA-Z ]{1,40}").unwrap(),
    ) -> RecordError {
        RecordError::new(kind, message)
    }
}

/// Strategy for the terminal outcome of a query record.
pub fn arb_query_outcome() -> impl Strategy<Value = QueryOutcome> {
    prop_oneof![
        arb_raw_result().prop_map(QueryOutcome::Succeeded),
        arb_record_error().prop_map(QueryOutcome::Failed),
        Just(QueryOutcome::Canceled),
    ]
}

/// Strategy for 1..=`max_queries` query records owned by `analysis_id`,
/// positioned in submission order.
pub fn arb_create_query_records(
    analysis_id: AnalysisId,
    max_queries: usize,
) -> impl Strategy<Value = Vec<CreateQueryRecord>> {
    prop::collection::vec(
        (
            proptest::string::string_regex("[a-z][a-z_]{2,15}").unwrap(),
            proptest::string::string_regex("SELECT [a-z]+ FROM [a-z]+").unwrap(),
        ),
        1..=max_queries,
    )
    .prop_map(move |queries| {
        queries
            .into_iter()
            .enumerate()
            .map(|(position, (name, sql))| CreateQueryRecord {
                analysis_id,
                position: position as i32,
                name,
                sql,
            })
            .collect()
    })
}

/// Strategy that generates one of the 5 valid status paths from Queued to a terminal status.
pub fn arb_valid_analysis_path() -> impl Strategy<Value = Vec<AnalysisStatus>> {
    use AnalysisStatus::*;
    prop_oneof![
        Just(vec![Queued, Running, Success]),
        Just(vec![Queued, Running, Error]),
        Just(vec![Queued, Running, Canceled]),
        // Settled before any query was submitted
        Just(vec![Queued, Error]),
        Just(vec![Queued, Canceled]),
    ]
}
