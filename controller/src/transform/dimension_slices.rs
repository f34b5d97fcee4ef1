use crate::transform::{ResultTransform, RowReader, TransformError, expect_queries};
use model::analysis::analysis_status::AnalysisKind;
use model::query::RawResult;
use serde::{Deserialize, Serialize};

pub const DIMENSION_SLICES_QUERY: &str = "dimension_slices";
const EXPECTED_QUERIES: &[&str] = &[DIMENSION_SLICES_QUERY];

/// Label used for rows whose dimension value is null.
pub const NULL_SLICE: &str = "(null)";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    pub name: String,
    pub units: u64,
    /// Share of the dimension's total units, 0..=100.
    pub percent: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionSlices {
    pub dimension: String,
    pub slices: Vec<Slice>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionSlicesResult {
    pub dimensions: Vec<DimensionSlices>,
}

/// Groups `(dimension_name, dimension_value, units, total_units)` rows into
/// per-dimension slices, in the order dimensions first appear.
#[derive(Clone, Copy, Debug, Default)]
pub struct DimensionSlicesTransform;

impl ResultTransform for DimensionSlicesTransform {
    type Output = DimensionSlicesResult;

    fn kind(&self) -> AnalysisKind {
        AnalysisKind::DimensionSlices
    }

    fn expected_queries(&self) -> Option<&[&str]> {
        Some(EXPECTED_QUERIES)
    }

    fn transform(&self, results: &[RawResult]) -> Result<Self::Output, TransformError> {
        expect_queries(results, 1)?;

        let mut dimensions: Vec<DimensionSlices> = Vec::new();
        for (i, row) in results[0].rows.iter().enumerate() {
            let reader = RowReader::new(0, i, row);
            let dimension = reader.label("dimension_name")?;
            let name = reader
                .optional_label("dimension_value")?
                .unwrap_or_else(|| NULL_SLICE.to_string());
            let units = reader.count("units")?;
            let total = reader.count("total_units")?;
            let percent = if total == 0 {
                0.0
            } else {
                units as f64 / total as f64 * 100.0
            };

            let slice = Slice {
                name,
                units,
                percent,
            };
            match dimensions.iter_mut().find(|d| d.dimension == dimension) {
                Some(existing) => existing.slices.push(slice),
                None => dimensions.push(DimensionSlices {
                    dimension,
                    slices: vec![slice],
                }),
            }
        }

        Ok(DimensionSlicesResult { dimensions })
    }
}
