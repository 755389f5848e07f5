//! Job lifecycle tracking for pipeline submissions

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, warn};

use crate::error::{RecollectError, Result};
use crate::retry::with_timeout;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Pipeline stage a job is in (or failed in)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Embedding,
    Indexing,
    Storage,
    Pipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// `pending → processing → {completed, failed}`; a pending job may also
    /// fail before it is picked up
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Processing)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
        )
    }
}

/// Lifecycle record for one pipeline submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub memory_id: String,
    pub user_id: String,
    pub stage: JobStage,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set only once the job reaches a terminal state
    pub processing_time_ms: Option<u64>,
    pub error: Option<String>,
    /// True when the job was answered from the memory cache
    #[serde(default)]
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Submitted,
    StageChanged,
    StateChanged,
    Cached,
}

/// One observable change to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: String,
    pub memory_id: String,
    pub user_id: String,
    pub stage: JobStage,
    pub state: JobState,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    fn from_status(kind: JobEventKind, status: &JobStatus) -> Self {
        Self {
            kind,
            job_id: status.id.clone(),
            memory_id: status.memory_id.clone(),
            user_id: status.user_id.clone(),
            stage: status.stage,
            state: status.state,
            error: status.error.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Counts of jobs per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn active(&self) -> usize {
        self.pending + self.processing
    }
}

/// Owns every `JobStatus` and publishes their transitions
#[derive(Debug)]
pub struct JobTracker {
    jobs: DashMap<String, JobStatus>,
    events: broadcast::Sender<JobEvent>,
    finished: Notify,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: DashMap::new(),
            events,
            finished: Notify::new(),
        }
    }

    fn emit(&self, kind: JobEventKind, status: &JobStatus) {
        // No receivers is fine
        let _ = self.events.send(JobEvent::from_status(kind, status));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Register a new pending job
    pub fn create(&self, job_id: &str, memory_id: &str, user_id: &str) -> JobStatus {
        let status = JobStatus {
            id: job_id.to_string(),
            memory_id: memory_id.to_string(),
            user_id: user_id.to_string(),
            stage: JobStage::Embedding,
            state: JobState::Pending,
            started_at: Utc::now(),
            ended_at: None,
            processing_time_ms: None,
            error: None,
            cached: false,
        };
        self.jobs.insert(job_id.to_string(), status.clone());
        self.emit(JobEventKind::Submitted, &status);
        status
    }

    /// Register a job that was satisfied from cache and is already complete
    pub fn create_cached(&self, job_id: &str, memory_id: &str, user_id: &str) -> JobStatus {
        let now = Utc::now();
        let status = JobStatus {
            id: job_id.to_string(),
            memory_id: memory_id.to_string(),
            user_id: user_id.to_string(),
            stage: JobStage::Pipeline,
            state: JobState::Completed,
            started_at: now,
            ended_at: Some(now),
            processing_time_ms: Some(0),
            error: None,
            cached: true,
        };
        self.jobs.insert(job_id.to_string(), status.clone());
        self.emit(JobEventKind::Cached, &status);
        self.finished.notify_waiters();
        status
    }

    pub fn get(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|s| s.clone())
    }

    /// Move a job to `next`, rejecting transitions the state machine forbids
    pub fn transition(&self, job_id: &str, next: JobState, error: Option<String>) -> Result<()> {
        let snapshot = {
            let mut status = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| RecollectError::NotFound(format!("job {job_id}")))?;

            if status.state == next {
                return Ok(());
            }
            if !status.state.can_transition_to(next) {
                warn!(job_id, from = ?status.state, to = ?next, "Illegal job transition");
                return Err(RecollectError::Pipeline(format!(
                    "Job {job_id} cannot move from {:?} to {next:?}",
                    status.state
                )));
            }

            status.state = next;
            if error.is_some() {
                status.error = error;
            }
            if next.is_terminal() {
                let now = Utc::now();
                status.ended_at = Some(now);
                status.processing_time_ms =
                    Some((now - status.started_at).num_milliseconds().max(0) as u64);
            }
            status.clone()
        };

        debug!(job_id, state = ?next, stage = ?snapshot.stage, "Job transitioned");
        self.emit(JobEventKind::StateChanged, &snapshot);
        if next.is_terminal() {
            self.finished.notify_waiters();
        }
        Ok(())
    }

    pub fn advance_stage(&self, job_id: &str, stage: JobStage) {
        let snapshot = match self.jobs.get_mut(job_id) {
            Some(mut status) if !status.state.is_terminal() && status.stage != stage => {
                status.stage = stage;
                status.clone()
            }
            _ => return,
        };
        self.emit(JobEventKind::StageChanged, &snapshot);
    }

    /// Mark a job failed in `stage`, whatever non-terminal state it is in
    pub fn fail(&self, job_id: &str, stage: JobStage, error: impl Into<String>) {
        self.advance_stage(job_id, stage);
        if let Err(e) = self.transition(job_id, JobState::Failed, Some(error.into())) {
            debug!(job_id, error = %e, "Job could not be failed");
        }
    }

    /// Wait until the job reaches a terminal state
    pub async fn await_job(&self, job_id: &str, timeout: Duration) -> Result<JobStatus> {
        with_timeout(timeout, "await job", async {
            loop {
                let notified = self.finished.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let status = self
                    .get(job_id)
                    .ok_or_else(|| RecollectError::NotFound(format!("job {job_id}")))?;
                if status.state.is_terminal() {
                    return Ok(status);
                }
                notified.await;
            }
        })
        .await
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for status in self.jobs.iter() {
            match status.state {
                JobState::Pending => counts.pending += 1,
                JobState::Processing => counts.processing += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Drop terminal jobs that ended more than `older_than` ago
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let before = self.jobs.len();
        self.jobs.retain(|_, status| {
            !(status.state.is_terminal() && status.ended_at.is_some_and(|t| t <= cutoff))
        });
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
