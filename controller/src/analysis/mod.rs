pub mod query_task;
pub mod runner;

use crate::builder::QueryBuilder;
use model::analysis::TargetKey;
use model::query::Row;
use serde::Serialize;
use std::time::Duration;

pub use runner::QueryRunner;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Pause between two polls of a pending job.
    pub poll_interval: Duration,
    /// Polling a job for longer than this fails its query with a timeout.
    pub poll_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// What the caller of [`QueryRunner::start_analysis`] gets back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartMode {
    /// Wait until the analysis reached a terminal status.
    #[default]
    Settled,
    /// Return the Running analysis as soon as its queries were handed off.
    Detached,
}

pub struct StartAnalysis<P, T> {
    pub target_key: TargetKey,
    pub params: P,
    pub builders: Vec<Box<dyn QueryBuilder<P>>>,
    pub transform: T,
    pub mode: StartMode,
}

impl<P, T> StartAnalysis<P, T> {
    pub fn new(target_key: impl Into<TargetKey>, params: P, transform: T) -> Self {
        Self {
            target_key: target_key.into(),
            params,
            builders: Vec::new(),
            transform,
            mode: StartMode::default(),
        }
    }

    pub fn query(mut self, builder: Box<dyn QueryBuilder<P>>) -> Self {
        self.builders.push(builder);
        self
    }

    pub fn detached(mut self) -> Self {
        self.mode = StartMode::Detached;
        self
    }
}

/// Outcome of an ad-hoc, row-limited query. Nothing about it is persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestQueryResult {
    pub rows: Vec<Row>,
    /// The query text as sent to the warehouse, limit included.
    pub sql: String,
    pub duration: Duration,
    pub error: Option<String>,
}
