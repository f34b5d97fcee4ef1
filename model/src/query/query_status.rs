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
    enum_name = "query_status",
    rename_all = "PascalCase"
)]
#[strum(serialize_all = "PascalCase")]
pub enum QueryStatus {
    #[default]
    #[sea_orm(string_value = "Running")]
    Running, // Query was handed to the integration
    #[sea_orm(string_value = "Succeeded")]
    Succeeded, // Warehouse returned rows
    #[sea_orm(string_value = "Failed")]
    Failed,    // Submission, execution or polling failed
    #[sea_orm(string_value = "Canceled")]
    Canceled,  // Query was canceled before it settled
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryStatus::Running)
    }

    pub fn transitions(&self) -> Vec<QueryStatus> {
        match self {
            QueryStatus::Running => vec![
                QueryStatus::Succeeded,
                QueryStatus::Failed,
                QueryStatus::Canceled,
            ],
            // Terminal records are immutable
            QueryStatus::Succeeded | QueryStatus::Failed | QueryStatus::Canceled => vec![],
        }
    }

    pub fn invalid_transitions(&self) -> Vec<QueryStatus> {
        let valid = self.transitions();
        QueryStatus::iter()
            .filter(|s| *s != *self && !valid.contains(s))
            .collect()
    }
}
