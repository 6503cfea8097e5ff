// src/engine/poller.rs
use std::collections::BTreeMap;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SpiderFootConfig;
use crate::core::{Deadline, ToolOutcome};

/// Lifecycle state of a remote job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    /// A stop was requested and the remote side is winding down
    Stopping,
    Finished,
    Aborted,
    Failed,
}

impl JobState {
    /// Map a SpiderFoot status string
    pub fn parse(status: &str) -> Self {
        match status.trim().to_uppercase().as_str() {
            "FINISHED" => JobState::Finished,
            "ABORTED" => JobState::Aborted,
            "ERROR-FAILED" | "FAILED" => JobState::Failed,
            "ABORT-REQUESTED" => JobState::Stopping,
            _ => JobState::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Aborted | JobState::Failed)
    }
}

/// One entity reported by a remote job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_data: Option<String>,
}

impl Entity {
    pub fn new(entity_type: &str, value: &str, module: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            value: value.to_string(),
            module: module.to_string(),
            source_data: None,
        }
    }

    /// Identity used to merge snapshots
    pub fn key(&self) -> (String, String, String) {
        (self.entity_type.clone(), self.value.clone(), self.module.clone())
    }
}

/// A long-running job on a remote engine
#[async_trait]
pub trait RemoteJob: Send + Sync {
    fn id(&self) -> &str;

    async fn status(&self) -> ToolOutcome<JobState>;

    /// Everything the job has produced so far, not a delta
    async fn snapshot(&self) -> ToolOutcome<Vec<Entity>>;

    async fn stop(&self) -> ToolOutcome<()>;
}

/// Latest observed entity set
#[derive(Debug, Default)]
pub struct EntityAccumulator {
    entities: BTreeMap<(String, String, String), Entity>,
}

impl EntityAccumulator {
    /// Replace the accumulated set with a fresh snapshot. A snapshot smaller
    /// than what was already seen is ignored. Returns whether it was taken.
    pub fn replace(&mut self, snapshot: Vec<Entity>) -> bool {
        let fresh: BTreeMap<_, _> = snapshot.into_iter().map(|e| (e.key(), e)).collect();
        if fresh.len() < self.entities.len() {
            debug!("Ignoring snapshot with {} entities, already holding {}", fresh.len(), self.entities.len());
            return false;
        }
        self.entities = fresh;
        true
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn into_vec(self) -> Vec<Entity> {
        self.entities.into_values().collect()
    }
}

/// Poll timing
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub poll_interval: Duration,
    /// Wait after a terminal status before the last fetch
    pub settle_delay: Duration,
    pub grace_period: Duration,
    pub grace_poll_interval: Duration,
    /// Wait after the grace period before the last fetch
    pub final_delay: Duration,
}

impl PollSettings {
    pub fn from_config(config: &SpiderFootConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            settle_delay: Duration::from_secs(config.settle_delay_secs),
            grace_period: Duration::from_secs(config.grace_period_secs),
            grace_poll_interval: Duration::from_secs(config.grace_poll_interval_secs.max(1)),
            final_delay: Duration::from_secs(config.final_delay_secs),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from_config(&SpiderFootConfig::default())
    }
}

/// Progress published while polling
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollProgress {
    pub state: Option<JobState>,
    pub entities: usize,
    pub polls: usize,
    pub elapsed_secs: u64,
    /// Percentage of the budget used
    pub percent: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResult {
    pub job_id: String,
    pub state: Option<JobState>,
    pub entities: Vec<Entity>,
    pub timed_out: bool,
    pub polls: usize,
    pub elapsed_secs: f64,
}

/// Drives a remote job to completion or to the deadline
pub struct JobPoller {
    settings: PollSettings,
    progress: watch::Sender<PollProgress>,
}

impl JobPoller {
    pub fn new(settings: PollSettings) -> Self {
        let (progress, _) = watch::channel(PollProgress::default());
        Self { settings, progress }
    }

    pub fn subscribe(&self) -> watch::Receiver<PollProgress> {
        self.progress.subscribe()
    }

    pub async fn run(&self, job: &dyn RemoteJob, deadline: &Deadline) -> PollResult {
        info!("Polling job {} every {:?} (budget {:?})", job.id(), self.settings.poll_interval, deadline.budget());

        let mut accumulator = EntityAccumulator::default();
        let mut state: Option<JobState> = None;
        let mut polls = 0usize;

        while !deadline.is_expired() {
            if let Some(current) = self.fetch_status(job).await {
                state = Some(current);
            }
            self.refresh(job, &mut accumulator).await;
            polls += 1;
            self.publish(state.clone(), &accumulator, polls, deadline);

            if let Some(current) = state.as_ref().filter(|s| s.is_terminal()) {
                info!("Job {} reached {:?}; waiting {:?} before the final fetch", job.id(), current, self.settings.settle_delay);
                tokio::time::sleep(self.settings.settle_delay).await;
                self.refresh(job, &mut accumulator).await;
                self.publish(state.clone(), &accumulator, polls, deadline);
                return self.finish(job, state, accumulator, false, polls, deadline);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = deadline.expired() => {}
            }
        }

        // Deadline reached
        warn!("Job {} exceeded its {:?} budget; requesting stop", job.id(), deadline.budget());
        match job.stop().await {
            ToolOutcome::Success(()) => info!("Stop requested for job {}", job.id()),
            outcome => warn!("Could not stop job {}: {}", job.id(), outcome),
        }

        let grace = Deadline::new(self.settings.grace_period);
        while !grace.is_expired() {
            tokio::time::sleep(grace.cap(self.settings.grace_poll_interval)).await;
            self.refresh(job, &mut accumulator).await;
            polls += 1;

            // Stopping still writes results; only a terminal state ends the grace period early
            if let Some(current) = self.fetch_status(job).await {
                let settled = current.is_terminal();
                state = Some(current);
                if settled {
                    debug!("Job {} settled during the grace period", job.id());
                    break;
                }
            }
            self.publish(state.clone(), &accumulator, polls, deadline);
        }

        tokio::time::sleep(self.settings.final_delay).await;
        self.refresh(job, &mut accumulator).await;
        self.publish(state.clone(), &accumulator, polls, deadline);
        self.finish(job, state, accumulator, true, polls, deadline)
    }

    async fn fetch_status(&self, job: &dyn RemoteJob) -> Option<JobState> {
        match job.status().await {
            ToolOutcome::Success(state) => {
                debug!("Job {} status: {:?}", job.id(), state);
                Some(state)
            }
            outcome => {
                warn!("Status check for job {} failed: {}", job.id(), outcome);
                None
            }
        }
    }

    async fn refresh(&self, job: &dyn RemoteJob, accumulator: &mut EntityAccumulator) {
        match job.snapshot().await {
            ToolOutcome::Success(entities) => {
                let before = accumulator.len();
                if accumulator.replace(entities) && accumulator.len() > before {
                    info!("Job {} progress: {} entities", job.id(), accumulator.len());
                }
            }
            outcome => warn!("Result fetch for job {} failed: {}", job.id(), outcome),
        }
    }

    fn publish(&self, state: Option<JobState>, accumulator: &EntityAccumulator, polls: usize, deadline: &Deadline) {
        let budget = deadline.budget().as_secs_f64();
        let percent = if budget > 0.0 {
            ((deadline.elapsed().as_secs_f64() / budget) * 100.0).min(100.0) as u8
        } else {
            100
        };
        self.progress.send_replace(PollProgress {
            state,
            entities: accumulator.len(),
            polls,
            elapsed_secs: deadline.elapsed().as_secs(),
            percent,
        });
    }

    fn finish(
        &self,
        job: &dyn RemoteJob,
        state: Option<JobState>,
        accumulator: EntityAccumulator,
        timed_out: bool,
        polls: usize,
        deadline: &Deadline,
    ) -> PollResult {
        let entities = accumulator.into_vec();
        info!("Job {} done after {} polls with {} entities (timed out: {})", job.id(), polls, entities.len(), timed_out);
        PollResult {
            job_id: job.id().to_string(),
            state,
            entities,
            timed_out,
            polls,
            elapsed_secs: deadline.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Scripted job: status and entity count are functions of time since creation
    struct ScriptedJob {
        started: Instant,
        finishes_after: Option<Duration>,
        entities_per_sec: usize,
        stopped: Mutex<Option<Instant>>,
        snapshots: Mutex<usize>,
    }

    impl ScriptedJob {
        fn new(finishes_after: Option<Duration>, entities_per_sec: usize) -> Self {
            Self {
                started: Instant::now(),
                finishes_after,
                entities_per_sec,
                stopped: Mutex::new(None),
                snapshots: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteJob for ScriptedJob {
        fn id(&self) -> &str {
            "job-1"
        }

        async fn status(&self) -> ToolOutcome<JobState> {
            let finished = self.finishes_after.is_some_and(|after| self.started.elapsed() >= after);
            let state = if finished {
                JobState::Finished
            } else if self.stopped.lock().is_some() {
                JobState::Stopping
            } else {
                JobState::Running
            };
            ToolOutcome::Success(state)
        }

        async fn snapshot(&self) -> ToolOutcome<Vec<Entity>> {
            *self.snapshots.lock() += 1;
            let secs = self.started.elapsed().as_secs() as usize;
            let count = secs * self.entities_per_sec;
            // Every poll returns the full set, including entities seen before
            ToolOutcome::Success(
                (0..count)
                    .map(|i| Entity::new("INTERNET_NAME", &format!("h{}.example.com", i), "sfp_dnsresolve"))
                    .collect(),
            )
        }

        async fn stop(&self) -> ToolOutcome<()> {
            *self.stopped.lock() = Some(Instant::now());
            ToolOutcome::Success(())
        }
    }

    fn settings() -> PollSettings {
        PollSettings {
            poll_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(5),
            grace_period: Duration::from_secs(10),
            grace_poll_interval: Duration::from_secs(2),
            final_delay: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_job_state_parse() {
        assert_eq!(JobState::parse("FINISHED"), JobState::Finished);
        assert_eq!(JobState::parse("ERROR-FAILED"), JobState::Failed);
        assert_eq!(JobState::parse("ABORT-REQUESTED"), JobState::Stopping);
        assert_eq!(JobState::parse("RUNNING"), JobState::Running);
        assert!(!JobState::Stopping.is_terminal());
    }

    #[test]
    fn test_accumulator_replaces_without_double_counting() {
        let mut acc = EntityAccumulator::default();
        let a = Entity::new("IP_ADDRESS", "192.0.2.1", "sfp_dnsresolve");
        let b = Entity::new("INTERNET_NAME", "www.example.com", "sfp_crt");

        assert!(acc.replace(vec![a.clone()]));
        assert!(acc.replace(vec![a.clone(), b.clone(), b.clone()]));
        assert_eq!(acc.len(), 2);

        // A failed or truncated fetch keeps what was seen
        assert!(!acc.replace(vec![]));
        assert_eq!(acc.into_vec().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_stops_polling() {
        let job = ScriptedJob::new(Some(Duration::from_secs(12)), 1);
        let poller = JobPoller::new(settings());
        let deadline = Deadline::new(Duration::from_secs(600));

        let result = poller.run(&job, &deadline).await;
        assert!(!result.timed_out);
        assert_eq!(result.state, Some(JobState::Finished));
        // polls at 0, 5, 10, 15; settle to 20
        assert_eq!(result.polls, 4);
        assert_eq!(result.entities.len(), 20);
        assert!(job.stopped.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_job_and_collects_grace_results() {
        let job = ScriptedJob::new(None, 2);
        let poller = JobPoller::new(settings());
        let progress = poller.subscribe();
        let deadline = Deadline::new(Duration::from_secs(30));

        let result = poller.run(&job, &deadline).await;
        assert!(result.timed_out);
        assert!(result.elapsed_secs >= 30.0);

        let stopped_at = job.stopped.lock().expect("stop requested");
        assert!(stopped_at.duration_since(job.started) >= Duration::from_secs(30));

        // Grace polls from 32s to 40s, final fetch after 3s more
        assert_eq!(result.state, Some(JobState::Stopping));
        assert_eq!(result.entities.len(), 86);
        assert_eq!(progress.borrow().entities, 86);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_job_is_polled_for_the_whole_grace_period() {
        let job = ScriptedJob::new(None, 2);
        let poller = JobPoller::new(PollSettings {
            final_delay: Duration::ZERO,
            ..settings()
        });
        let deadline = Deadline::new(Duration::from_secs(30));

        let result = poller.run(&job, &deadline).await;
        assert!(result.timed_out);
        assert_eq!(result.state, Some(JobState::Stopping));
        assert!(result.elapsed_secs >= 40.0, "elapsed {}", result.elapsed_secs);
        // Entities written while winding down are kept
        assert_eq!(result.entities.len(), 80);
        // Six main-loop polls, five during the grace period
        assert_eq!(result.polls, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_state_during_grace_ends_it_early() {
        let job = ScriptedJob::new(Some(Duration::from_secs(34)), 1);
        let poller = JobPoller::new(PollSettings {
            final_delay: Duration::ZERO,
            ..settings()
        });
        let deadline = Deadline::new(Duration::from_secs(30));

        let result = poller.run(&job, &deadline).await;
        assert!(result.timed_out);
        assert_eq!(result.state, Some(JobState::Finished));
        assert!(result.elapsed_secs < 40.0, "elapsed {}", result.elapsed_secs);
    }
}
