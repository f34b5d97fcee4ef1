#[cfg(feature = "testing")]
use proptest_derive::Arbitrary;
use sea_orm::{DeriveActiveEnum, EnumIter, Iterable};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[cfg_attr(feature = "testing", derive(Arbitrary))]
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    EnumString,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(
    rs_type = "String",
    db_type = "Enum",
    enum_name = "analysis_status",
    rename_all = "PascalCase"
)]
#[strum(serialize_all = "PascalCase")]
pub enum AnalysisStatus {
    #[default]
    #[sea_orm(string_value = "Queued")]
    Queued, // Analysis was inserted, queries not yet submitted
    #[sea_orm(string_value = "Running")]
    Running,  // Queries were submitted
    #[sea_orm(string_value = "Success")]
    Success,  // All queries succeeded and the transform produced a result
    #[sea_orm(string_value = "Error")]
    Error,    // A query or the transform failed
    #[sea_orm(string_value = "Canceled")]
    Canceled, // Analysis was canceled from the outside
}

impl AnalysisStatus {
    /// Statuses covered by the single-flight guard.
    pub const IN_FLIGHT: [AnalysisStatus; 2] = [AnalysisStatus::Queued, AnalysisStatus::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Success | AnalysisStatus::Error | AnalysisStatus::Canceled
        )
    }

    pub fn transitions(&self) -> Vec<AnalysisStatus> {
        match self {
            // Query records may fail to persist before anything was submitted
            AnalysisStatus::Queued => vec![
                AnalysisStatus::Running,
                AnalysisStatus::Error,
                AnalysisStatus::Canceled,
            ],
            AnalysisStatus::Running => vec![
                AnalysisStatus::Success,
                AnalysisStatus::Error,
                AnalysisStatus::Canceled,
            ],
            AnalysisStatus::Success | AnalysisStatus::Error | AnalysisStatus::Canceled => vec![],
        }
    }

    /// All statuses from which `self` may be entered.
    pub fn predecessors(&self) -> Vec<AnalysisStatus> {
        AnalysisStatus::iter()
            .filter(|s| s.transitions().contains(self))
            .collect()
    }

    pub fn invalid_transitions(&self) -> Vec<AnalysisStatus> {
        let valid = self.transitions();
        AnalysisStatus::iter()
            .filter(|s| *s != *self && !valid.contains(s))
            .collect()
    }
}

/// Kind of aggregate an analysis produces, used to pick its result transform.
#[cfg_attr(feature = "testing", derive(Arbitrary))]
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    EnumIter,
    EnumString,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(
    rs_type = "String",
    db_type = "Enum",
    enum_name = "analysis_kind",
    rename_all = "PascalCase"
)]
#[strum(serialize_all = "PascalCase")]
pub enum AnalysisKind {
    #[sea_orm(string_value = "DimensionSlices")]
    DimensionSlices,
    #[sea_orm(string_value = "MetricAggregate")]
    MetricAggregate,
    #[default]
    #[sea_orm(string_value = "Custom")]
    Custom,
}
