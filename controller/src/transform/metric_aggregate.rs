use crate::transform::{ResultTransform, RowReader, TransformError, expect_queries};
use model::analysis::analysis_status::AnalysisKind;
use model::query::RawResult;
use serde::{Deserialize, Serialize};

pub const METRIC_AGGREGATE_QUERY: &str = "metric_aggregate";
const EXPECTED_QUERIES: &[&str] = &[METRIC_AGGREGATE_QUERY];

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub count: u64,
    pub mean: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SliceStats {
    pub name: String,
    #[serde(flatten)]
    pub stats: Stats,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricAggregate {
    pub overall: Stats,
    pub slices: Vec<SliceStats>,
}

#[derive(Default)]
struct Accumulator {
    count: u64,
    sum: f64,
}

impl Accumulator {
    /// `None` when the count no longer fits.
    fn add(&mut self, count: u64, sum: f64) -> Option<()> {
        self.count = self.count.checked_add(count)?;
        self.sum += sum;
        Some(())
    }

    fn stats(&self) -> Stats {
        let mean = if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        };
        Stats {
            count: self.count,
            mean,
        }
    }
}

/// Folds `(slice?, count, main_sum)` rows into overall and per-slice count and mean.
/// Rows without a slice value only count towards the overall figures. A null
/// `main_sum` is what `SUM` returns over an empty window and reads as zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricAggregateTransform;

impl ResultTransform for MetricAggregateTransform {
    type Output = MetricAggregate;

    fn kind(&self) -> AnalysisKind {
        AnalysisKind::MetricAggregate
    }

    fn expected_queries(&self) -> Option<&[&str]> {
        Some(EXPECTED_QUERIES)
    }

    fn transform(&self, results: &[RawResult]) -> Result<Self::Output, TransformError> {
        expect_queries(results, 1)?;

        let mut overall = Accumulator::default();
        let mut slices: Vec<(String, Accumulator)> = Vec::new();
        for (i, row) in results[0].rows.iter().enumerate() {
            let reader = RowReader::new(0, i, row);
            let count = reader.count("count")?;
            let sum = reader.optional_number("main_sum")?.unwrap_or(0.0);
            overall
                .add(count, sum)
                .ok_or_else(|| reader.overflow("count"))?;

            if let Some(name) = reader.optional_label("slice")? {
                let slot = match slices.iter().position(|(n, _)| *n == name) {
                    Some(slot) => slot,
                    None => {
                        slices.push((name, Accumulator::default()));
                        slices.len() - 1
                    }
                };
                slices[slot]
                    .1
                    .add(count, sum)
                    .ok_or_else(|| reader.overflow("count"))?;
            }
        }

        Ok(MetricAggregate {
            overall: overall.stats(),
            slices: slices
                .into_iter()
                .map(|(name, acc)| SliceStats {
                    name,
                    stats: acc.stats(),
                })
                .collect(),
        })
    }
}
