//! Test doubles for the runner: a scripted warehouse and a hand-stepped clock.
//!
//! This module is only available in tests or with the `testing` feature.

use crate::clock::Clock;
use crate::integration::{
    Integration, IntegrationError, JobHandle, PollStatus, Submission, TemplateVariables, render,
};
use async_trait::async_trait;
use model::query::{RawResult, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

const LOCK_MSG: &str = "No one should panic while holding this lock";

/// Parses a JSON array of objects into rows. Panics on anything else.
pub fn rows(value: Value) -> RawResult {
    let rows: Vec<Row> = serde_json::from_value(value).expect("rows must be an array of objects");
    RawResult::new(rows)
}

/// How the scripted warehouse answers a query.
#[derive(Clone, Debug)]
pub enum Script {
    /// Synchronous result.
    Rows(RawResult),
    /// Synchronous execution failure.
    Fail(String),
    /// The warehouse refuses the submission.
    Reject(String),
    /// A job that is pending until poll number `polls`, which answers `then`.
    Job { polls: usize, then: PollStatus },
    /// A job that stays pending forever.
    Never,
    /// A submission that never returns.
    Hang,
    /// A submission that answers with `then` once `release` is notified.
    Held {
        release: Arc<Notify>,
        then: Box<Script>,
    },
}

impl Script {
    pub fn rows(value: Value) -> Self {
        Script::Rows(rows(value))
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Script::Fail(message.into())
    }

    pub fn after_polls(polls: usize, value: Value) -> Self {
        Script::Job {
            polls,
            then: PollStatus::Succeeded(rows(value)),
        }
    }

    pub fn held(release: &Arc<Notify>, then: Script) -> Self {
        Script::Held {
            release: release.clone(),
            then: Box::new(then),
        }
    }

    pub fn fail_after_polls(polls: usize, message: impl Into<String>) -> Self {
        Script::Job {
            polls,
            then: PollStatus::Failed(message.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Submit(String),
    Poll(JobHandle),
    Cancel(JobHandle),
}

struct Job {
    polls: usize,
    script: Script,
}

/// Integration double answering each query according to the first script
/// whose key occurs in the rendered query text. Every call is recorded.
#[derive(Default)]
pub struct ScriptedIntegration {
    scripts: Mutex<Vec<(String, Script)>>,
    jobs: Mutex<HashMap<JobHandle, Job>>,
    calls: Mutex<Vec<Call>>,
    next_job: AtomicUsize,
    failing_cancels: AtomicBool,
}

impl ScriptedIntegration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, sql_fragment: impl Into<String>, script: Script) -> Self {
        lock(&self.scripts).push((sql_fragment.into(), script));
        self
    }

    /// Registers a job as if an earlier process had submitted it.
    pub fn with_job(self, handle: impl Into<JobHandle>, script: Script) -> Self {
        lock(&self.jobs).insert(handle.into(), Job { polls: 0, script });
        self
    }

    /// Makes every cancellation request fail as if the warehouse was unreachable.
    pub fn with_failing_cancels(self) -> Self {
        self.failing_cancels.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn submitted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit(sql) => Some(sql),
                _ => None,
            })
            .collect()
    }

    pub fn polls(&self, handle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Poll(h) if h == handle))
            .count()
    }

    pub fn canceled(&self) -> Vec<JobHandle> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Cancel(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// Jobs that neither settled nor were canceled.
    pub fn open_jobs(&self) -> Vec<JobHandle> {
        let mut open: Vec<_> = lock(&self.jobs).keys().cloned().collect();
        open.sort();
        open
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }

    fn script_for(&self, sql: &str) -> Script {
        lock(&self.scripts)
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| Script::Reject(format!("no script for '{sql}'")))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect(LOCK_MSG)
}

#[async_trait]
impl Integration for ScriptedIntegration {
    async fn submit_query(
        &self,
        sql: &str,
        vars: &TemplateVariables,
    ) -> Result<Submission, IntegrationError> {
        let sql = render(sql, vars);
        self.record(Call::Submit(sql.clone()));

        let mut script = self.script_for(&sql);
        while let Script::Held { release, then } = script {
            release.notified().await;
            script = *then;
        }

        match script {
            Script::Rows(rows) => Ok(Submission::Rows(rows)),
            Script::Fail(message) => Err(IntegrationError::Execution(message)),
            Script::Reject(message) => Err(IntegrationError::Rejected(message)),
            Script::Hang => std::future::pending().await,
            Script::Held { .. } => unreachable!("held scripts are released above"),
            script @ (Script::Job { .. } | Script::Never) => {
                let handle = format!("job-{}", self.next_job.fetch_add(1, Ordering::SeqCst));
                lock(&self.jobs).insert(handle.clone(), Job { polls: 0, script });
                Ok(Submission::Pending(handle))
            }
        }
    }

    async fn poll_query(&self, handle: &str) -> Result<PollStatus, IntegrationError> {
        self.record(Call::Poll(handle.to_string()));

        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(handle)
            .ok_or_else(|| IntegrationError::UnknownJob(handle.to_string()))?;
        job.polls += 1;
        let status = match &job.script {
            Script::Job { polls, then } if job.polls >= *polls => then.clone(),
            Script::Rows(rows) => PollStatus::Succeeded(rows.clone()),
            Script::Fail(message) | Script::Reject(message) => PollStatus::Failed(message.clone()),
            _ => PollStatus::Pending,
        };
        if status != PollStatus::Pending {
            jobs.remove(handle);
        }
        Ok(status)
    }

    async fn cancel_query(&self, handle: &str) -> Result<(), IntegrationError> {
        self.record(Call::Cancel(handle.to_string()));
        if self.failing_cancels.load(Ordering::SeqCst) {
            return Err(IntegrationError::Unavailable("cancel endpoint down".into()));
        }
        lock(&self.jobs)
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| IntegrationError::UnknownJob(handle.to_string()))
    }
}

struct Sleeper {
    deadline: Instant,
    wake: oneshot::Sender<()>,
}

struct ManualClockState {
    now: Instant,
    sleepers: Vec<Sleeper>,
}

/// Clock that only moves when told to. Sleeps complete once [`ManualClock::advance`]
/// moved the time past their deadline.
pub struct ManualClock {
    state: Mutex<ManualClockState>,
    sleepers_changed: Notify,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManualClockState {
                now: Instant::now(),
                sleepers: Vec::new(),
            }),
            sleepers_changed: Notify::new(),
        })
    }

    pub fn advance(&self, by: Duration) {
        let due: Vec<Sleeper> = {
            let mut state = lock(&self.state);
            state.now += by;
            let now = state.now;
            let (due, pending) = std::mem::take(&mut state.sleepers)
                .into_iter()
                .partition(|s| s.deadline <= now);
            state.sleepers = pending;
            due
        };
        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
        self.sleepers_changed.notify_waiters();
    }

    /// Sleeps still awaited by someone.
    pub fn sleepers(&self) -> usize {
        lock(&self.state)
            .sleepers
            .iter()
            .filter(|s| !s.wake.is_closed())
            .count()
    }

    pub async fn wait_for_sleepers(&self, count: usize) {
        loop {
            let notified = self.sleepers_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.sleepers() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Waits until `sleepers` tasks are asleep, then moves time forward by `by`.
    pub async fn tick(&self, sleepers: usize, by: Duration) {
        self.wait_for_sleepers(sleepers).await;
        self.advance(by);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        lock(&self.state).now
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let (wake, woken) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            let deadline = state.now + duration;
            state.sleepers.push(Sleeper { deadline, wake });
        }
        self.sleepers_changed.notify_waiters();
        let _ = woken.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn manual_clock_wakes_due_sleepers_only() {
        let clock = ManualClock::new();
        let short = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(1)).await })
        };
        let long = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(5)).await })
        };

        clock.tick(2, Duration::from_secs(1)).await;
        short.await.unwrap();
        assert!(!long.is_finished());
        assert_eq!(clock.sleepers(), 1);

        clock.advance(Duration::from_secs(4));
        long.await.unwrap();
        assert_eq!(clock.sleepers(), 0);
    }

    #[tokio::test]
    async fn scripted_job_settles_on_its_poll() {
        let integration = ScriptedIntegration::new().on("slow", Script::after_polls(2, json!([{ "n": 1 }])));

        let Submission::Pending(handle) = integration
            .submit_query("SELECT slow", &TemplateVariables::new())
            .await
            .unwrap()
        else {
            panic!("expected a job");
        };

        assert_eq!(integration.poll_query(&handle).await.unwrap(), PollStatus::Pending);
        assert_eq!(
            integration.poll_query(&handle).await.unwrap(),
            PollStatus::Succeeded(rows(json!([{ "n": 1 }])))
        );
        assert!(integration.open_jobs().is_empty());
        assert_eq!(integration.polls(&handle), 2);
    }

    #[tokio::test]
    async fn unknown_queries_are_rejected() {
        let integration = ScriptedIntegration::new();
        assert!(matches!(
            integration
                .submit_query("SELECT 1", &TemplateVariables::new())
                .await,
            Err(IntegrationError::Rejected(_))
        ));
    }
}
