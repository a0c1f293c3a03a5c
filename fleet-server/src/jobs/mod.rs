//! # Job Orchestrator
//!
//! Dispatches a command to a resolved set of machines under a parallel or
//! rolling strategy, persists per-target execution state, and emits
//! job-level progress events.
//!
//! The orchestrator is event-driven: [`JobOrchestrator::pump`] runs the
//! dispatch loop for one job and is invoked on job creation, on every
//! execution reaching a terminal state, and on timer fire. Commands reach
//! agents through the dependency-inverted [`CommandDispatcher`] seam — this
//! module never imports the connection manager.

pub mod targets;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::StateCache;
use crate::dispatch::CommandDispatcher;
use crate::error::ServerResult;
use crate::events::EventBus;
use crate::store::{ExecutionRow, JobRow, Store};
use fleet_protocol::{
    ExecutionStatus, ExecutionUpdate, JobMode, JobProgress, JobStatus, ServerEvent,
};
use targets::{resolve_targets, TargetSpec};

/// How long a finished execution stays in the completed set, shielding it
/// from a racing disconnect grace timer.
const COMPLETED_RETENTION: Duration = Duration::from_secs(60);

/// How much trailing output becomes the error hint of a failed execution.
const ERROR_TAIL_CHARS: usize = 400;

/// An operator's job submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub command: String,
    pub mode: JobMode,
    #[serde(flatten)]
    pub targets: TargetSpec,
    #[serde(default)]
    pub strategy: StrategyOptions,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyOptions {
    pub concurrency: Option<usize>,
    pub batch_size: Option<usize>,
    pub batch_percent: Option<f64>,
    pub stop_on_failure_percent: Option<f64>,
    pub wait_seconds: Option<u64>,
}

/// Maps a dispatched command back to its job, execution and machine.
#[derive(Debug, Clone)]
pub struct InflightEntry {
    pub job_id: String,
    pub execution_id: String,
    pub machine_id: String,
    pub dispatched_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    success: usize,
    failed: usize,
    skipped: usize,
    aborted: usize,
}

impl Counts {
    fn bad(&self) -> usize {
        self.failed + self.skipped + self.aborted
    }
}

#[derive(Debug)]
struct QueuedTarget {
    execution_id: String,
    machine_id: String,
}

struct RollingState {
    batch_size: usize,
    stop_on_failure_percent: Option<f64>,
    wait: Duration,
    /// Executions of the current batch still short of a terminal state.
    in_batch: HashSet<String>,
    batch_total: usize,
    batch_failed: usize,
    /// A batch has been dispatched and not yet evaluated.
    batch_open: bool,
    /// The inter-batch wait timer is armed.
    waiting: bool,
    timer: Option<JoinHandle<()>>,
}

struct JobState {
    job_id: String,
    command: String,
    mode: JobMode,
    status: JobStatus,
    concurrency: usize,
    total: usize,
    queue: VecDeque<QueuedTarget>,
    running: HashSet<String>,
    counted: HashSet<String>,
    counts: Counts,
    aborted: bool,
    rolling: Option<RollingState>,
    finalized: bool,
}

pub struct JobOrchestrator {
    store: Arc<dyn Store>,
    cache: Arc<StateCache>,
    bus: EventBus,
    grace: Duration,
    max_concurrency: usize,
    dispatcher: RwLock<Option<Arc<dyn CommandDispatcher>>>,
    jobs: DashMap<String, Arc<tokio::sync::Mutex<JobState>>>,
    inflight: DashMap<String, InflightEntry>,
    completed_recently: DashMap<String, Instant>,
    grace_timers: DashMap<String, JoinHandle<()>>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<StateCache>,
        bus: EventBus,
        grace: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            grace,
            max_concurrency,
            dispatcher: RwLock::new(None),
            jobs: DashMap::new(),
            inflight: DashMap::new(),
            completed_recently: DashMap::new(),
            grace_timers: DashMap::new(),
        }
    }

    /// Wires the dispatcher after construction; breaks the orchestrator ↔
    /// connection-manager cycle.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn CommandDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    // ── Submission ──────────────────────────────────────────────

    pub async fn submit(self: &Arc<Self>, request: JobRequest) -> ServerResult<JobRow> {
        let machine_ids = resolve_targets(&request.targets, &self.cache);
        let now = Utc::now();
        let job_id = Uuid::new_v4().to_string();
        let created_by = request.created_by.unwrap_or_else(|| "operator".to_string());

        let job = JobRow {
            id: job_id.clone(),
            command: request.command.clone(),
            mode: request.mode,
            status: JobStatus::Pending,
            target_type: request.targets.target_type(),
            total_targets: machine_ids.len(),
            created_by,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.store.insert_job(job.clone()).await?;

        let mut queue = VecDeque::with_capacity(machine_ids.len());
        for machine_id in &machine_ids {
            let execution = ExecutionRow {
                id: Uuid::new_v4().to_string(),
                job_id: job_id.clone(),
                machine_id: machine_id.clone(),
                status: ExecutionStatus::Pending,
                exit_code: None,
                output: String::new(),
                error: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            };
            self.store.insert_execution(execution.clone()).await?;
            queue.push_back(QueuedTarget {
                execution_id: execution.id,
                machine_id: machine_id.clone(),
            });
        }

        self.store
            .update_job_status(&job_id, JobStatus::Running, Some(Utc::now()), None)
            .await?;

        let total = machine_ids.len();
        let concurrency = request
            .strategy
            .concurrency
            .unwrap_or(self.max_concurrency)
            .clamp(1, self.max_concurrency);
        let rolling = match request.mode {
            JobMode::Parallel => None,
            JobMode::Rolling => Some(RollingState {
                batch_size: batch_size(&request.strategy, total),
                stop_on_failure_percent: request.strategy.stop_on_failure_percent,
                wait: Duration::from_secs(request.strategy.wait_seconds.unwrap_or(0)),
                in_batch: HashSet::new(),
                batch_total: 0,
                batch_failed: 0,
                batch_open: false,
                waiting: false,
                timer: None,
            }),
        };

        let state = JobState {
            job_id: job_id.clone(),
            command: request.command,
            mode: request.mode,
            status: JobStatus::Running,
            concurrency,
            total,
            queue,
            running: HashSet::new(),
            counted: HashSet::new(),
            counts: Counts::default(),
            aborted: false,
            rolling,
            finalized: false,
        };
        self.jobs
            .insert(job_id.clone(), Arc::new(tokio::sync::Mutex::new(state)));

        info!(job_id = %job_id, targets = total, mode = ?request.mode, "job submitted");
        self.publish_progress_for(&job_id).await;
        self.pump(&job_id).await;

        Ok(self
            .store
            .job_by_id(&job_id)
            .await?
            .unwrap_or(job))
    }

    // ── Dispatch loop ───────────────────────────────────────────

    /// Runs the dispatch loop for one job: refills the in-flight set
    /// (parallel) or walks the batch machinery (rolling), then finalizes
    /// if the job has drained.
    pub async fn pump(self: &Arc<Self>, job_id: &str) {
        let Some(state_arc) = self.jobs.get(job_id).map(|e| e.value().clone()) else {
            return;
        };
        let mut state = state_arc.lock().await;
        self.advance_locked(&mut state).await;
        self.finalize_locked(&mut state).await;
    }

    async fn advance_locked(self: &Arc<Self>, state: &mut JobState) {
        if state.finalized || (state.aborted && state.queue.is_empty()) {
            return;
        }
        match state.mode {
            JobMode::Parallel => self.fill_parallel(state).await,
            JobMode::Rolling => self.advance_rolling(state).await,
        }
    }

    async fn fill_parallel(self: &Arc<Self>, state: &mut JobState) {
        while state.running.len() < state.concurrency {
            let Some(target) = state.queue.pop_front() else {
                break;
            };
            self.dispatch_one(state, target).await;
        }
    }

    async fn advance_rolling(self: &Arc<Self>, state: &mut JobState) {
        loop {
            let (waiting, batch_open, in_batch_empty) = {
                let r = state.rolling.as_ref().expect("rolling state");
                (r.waiting, r.batch_open, r.in_batch.is_empty())
            };
            if waiting {
                return;
            }

            if batch_open {
                if !in_batch_empty {
                    return;
                }
                // The batch is fully terminal; evaluate it.
                let (failed, total, stop_pct, wait) = {
                    let r = state.rolling.as_mut().expect("rolling state");
                    r.batch_open = false;
                    (
                        r.batch_failed,
                        r.batch_total,
                        r.stop_on_failure_percent,
                        r.wait,
                    )
                };
                if let Some(stop_pct) = stop_pct {
                    let rate = if total == 0 {
                        0.0
                    } else {
                        100.0 * failed as f64 / total as f64
                    };
                    if rate > stop_pct {
                        warn!(
                            job_id = %state.job_id,
                            rate,
                            threshold = stop_pct,
                            "batch failure threshold exceeded, aborting remainder"
                        );
                        self.skip_queued(state, "Batch failure threshold exceeded")
                            .await;
                        state.aborted = true;
                        state.status = JobStatus::Aborted;
                        return;
                    }
                }
                if state.queue.is_empty() {
                    return;
                }
                if !wait.is_zero() {
                    self.arm_batch_timer(state, wait);
                    return;
                }
            }

            if state.queue.is_empty() {
                return;
            }

            // Launch the next batch.
            let batch_size = state.rolling.as_ref().expect("rolling state").batch_size;
            let take = batch_size.max(1).min(state.queue.len());
            let batch: Vec<QueuedTarget> = state.queue.drain(..take).collect();
            {
                let r = state.rolling.as_mut().expect("rolling state");
                r.batch_open = true;
                r.batch_total = batch.len();
                r.batch_failed = 0;
                r.in_batch = batch.iter().map(|t| t.execution_id.clone()).collect();
            }
            for target in batch {
                self.dispatch_one(state, target).await;
            }
            // Loop: if every dispatch failed synchronously the batch is
            // already terminal and must be evaluated now.
        }
    }

    fn arm_batch_timer(self: &Arc<Self>, state: &mut JobState, wait: Duration) {
        let me = Arc::clone(self);
        let job_id = state.job_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(state_arc) = me.jobs.get(&job_id).map(|e| e.value().clone()) {
                {
                    let mut state = state_arc.lock().await;
                    if let Some(r) = state.rolling.as_mut() {
                        r.waiting = false;
                        r.timer = None;
                    }
                }
                me.pump(&job_id).await;
            }
        });
        let r = state.rolling.as_mut().expect("rolling state");
        r.waiting = true;
        r.timer = Some(handle);
    }

    async fn dispatch_one(self: &Arc<Self>, state: &mut JobState, target: QueuedTarget) {
        let dispatcher = self.dispatcher.read().clone();
        let Some(dispatcher) = dispatcher else {
            warn!(job_id = %state.job_id, "no dispatcher wired, refusing dispatch");
            self.apply_terminal(
                state,
                &target.execution_id,
                ExecutionStatus::Failed,
                None,
                Some("Dispatch refused".into()),
            )
            .await;
            return;
        };

        if !dispatcher.is_machine_online(&target.machine_id) {
            self.apply_terminal(
                state,
                &target.execution_id,
                ExecutionStatus::Failed,
                None,
                Some("Agent offline".into()),
            )
            .await;
            return;
        }

        if let Err(e) = self
            .store
            .mark_execution_running(&target.execution_id, Utc::now())
            .await
        {
            warn!(execution_id = %target.execution_id, error = %e, "store write failed");
        }
        state.running.insert(target.execution_id.clone());
        self.bus.publish(ServerEvent::JobExecutionUpdated {
            execution: ExecutionUpdate {
                execution_id: target.execution_id.clone(),
                job_id: state.job_id.clone(),
                machine_id: target.machine_id.clone(),
                status: ExecutionStatus::Running,
                exit_code: None,
                error: None,
            },
        });

        // The execution id doubles as the wire command id, which keeps the
        // response fallback lookup trivial.
        self.inflight.insert(
            target.execution_id.clone(),
            InflightEntry {
                job_id: state.job_id.clone(),
                execution_id: target.execution_id.clone(),
                machine_id: target.machine_id.clone(),
                dispatched_at: Instant::now(),
            },
        );

        let command = state.command.clone();
        let sent = dispatcher
            .send_command(&target.machine_id, &target.execution_id, &command)
            .await;
        if !sent {
            self.inflight.remove(&target.execution_id);
            self.apply_terminal(
                state,
                &target.execution_id,
                ExecutionStatus::Failed,
                None,
                Some("Dispatch refused".into()),
            )
            .await;
        }
    }

    async fn skip_queued(self: &Arc<Self>, state: &mut JobState, reason: &str) {
        let drained: Vec<QueuedTarget> = state.queue.drain(..).collect();
        for target in drained {
            self.apply_terminal(
                state,
                &target.execution_id,
                ExecutionStatus::Skipped,
                None,
                Some(reason.to_string()),
            )
            .await;
        }
    }

    /// Moves one execution to a terminal state: store write, batch and
    /// count bookkeeping, progress broadcast. The store refuses backward
    /// transitions, so a double-terminal attempt is harmless.
    async fn apply_terminal(
        &self,
        state: &mut JobState,
        execution_id: &str,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) {
        let row = match self
            .store
            .mark_execution_terminal(execution_id, status, exit_code, error, Utc::now())
            .await
        {
            Ok(row) => row,
            Err(e) => {
                warn!(execution_id, error = %e, "store write failed");
                return;
            }
        };

        state.running.remove(execution_id);
        if let Some(r) = state.rolling.as_mut() {
            if r.in_batch.remove(execution_id) && row.status == ExecutionStatus::Failed {
                r.batch_failed += 1;
            }
        }
        if state.counted.insert(execution_id.to_string()) {
            match row.status {
                ExecutionStatus::Success => state.counts.success += 1,
                ExecutionStatus::Failed => state.counts.failed += 1,
                ExecutionStatus::Skipped => state.counts.skipped += 1,
                ExecutionStatus::Aborted => state.counts.aborted += 1,
                ExecutionStatus::Pending | ExecutionStatus::Running => {}
            }
        }

        self.bus.publish(ServerEvent::JobExecutionUpdated {
            execution: ExecutionUpdate {
                execution_id: row.id.clone(),
                job_id: row.job_id.clone(),
                machine_id: row.machine_id.clone(),
                status: row.status,
                exit_code: row.exit_code,
                error: row.error.clone(),
            },
        });
        self.bus.publish(ServerEvent::JobUpdated {
            job: progress(state),
        });
    }

    async fn finalize_locked(&self, state: &mut JobState) {
        if state.finalized {
            return;
        }
        // An aborted job no longer advances its batch machinery, so an
        // open batch whose members have all drained counts as idle.
        let rolling_idle = state
            .rolling
            .as_ref()
            .map(|r| !r.waiting && (!r.batch_open || r.in_batch.is_empty()))
            .unwrap_or(true);
        if !(state.queue.is_empty() && state.running.is_empty() && rolling_idle) {
            return;
        }

        let status = if state.aborted {
            JobStatus::Aborted
        } else if state.counts.bad() > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Success
        };
        state.status = status;
        state.finalized = true;

        if let Err(e) = self
            .store
            .update_job_status(&state.job_id, status, None, Some(Utc::now()))
            .await
        {
            warn!(job_id = %state.job_id, error = %e, "store write failed");
        }
        info!(
            job_id = %state.job_id,
            ?status,
            success = state.counts.success,
            failed = state.counts.failed,
            skipped = state.counts.skipped,
            "job finished"
        );
        self.bus.publish(ServerEvent::JobUpdated {
            job: progress(state),
        });
        // The DB row is retained; only the in-memory state is cleared.
        self.jobs.remove(&state.job_id);
    }

    // ── Command responses ───────────────────────────────────────

    /// Routes a `command_response` from the agent session manager to its
    /// execution. Resolution order: inflight by command id, most recent
    /// inflight for the machine, then direct execution lookup by command
    /// id so output is persisted even without an inflight mapping.
    pub async fn handle_command_response(
        self: &Arc<Self>,
        machine_id: &str,
        command_id: Option<&str>,
        output: Option<&str>,
        exit_code: Option<i32>,
        completed: bool,
    ) {
        let entry = match command_id {
            Some(id) => self.inflight.get(id).map(|e| e.value().clone()),
            // Only a response without a command id may fall back to the
            // machine's most recent dispatch.
            None => self
                .inflight
                .iter()
                .filter(|e| e.machine_id == machine_id)
                .max_by_key(|e| e.dispatched_at)
                .map(|e| e.value().clone()),
        };

        let (job_id, execution_id) = match entry {
            Some(e) => (e.job_id, e.execution_id),
            None => {
                let Some(command_id) = command_id else { return };
                match self.store.execution_by_id(command_id).await {
                    Ok(Some(row)) => (row.job_id, row.id),
                    _ => return,
                }
            }
        };

        if let Some(chunk) = output {
            if !chunk.is_empty() {
                if let Err(e) = self
                    .store
                    .append_execution_output(&execution_id, chunk)
                    .await
                {
                    warn!(execution_id = %execution_id, error = %e, "output append failed");
                }
                self.bus.publish(ServerEvent::JobExecutionOutput {
                    job_id: job_id.clone(),
                    execution_id: execution_id.clone(),
                    machine_id: machine_id.to_string(),
                    output: chunk.to_string(),
                });
            }
        }

        if !completed {
            return;
        }

        let (status, error) = match exit_code {
            Some(0) => (ExecutionStatus::Success, None),
            None => {
                // Some agent builds omit the exit code entirely; treated
                // as success, but worth flagging.
                warn!(
                    execution_id = %execution_id,
                    machine_id,
                    "command response missing exitCode, treating as success"
                );
                (ExecutionStatus::Success, None)
            }
            Some(code) => {
                let tail = self
                    .store
                    .execution_by_id(&execution_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|row| tail_chars(&row.output, ERROR_TAIL_CHARS))
                    .filter(|t| !t.is_empty());
                (
                    ExecutionStatus::Failed,
                    Some(tail.unwrap_or_else(|| format!("exited with code {code}"))),
                )
            }
        };

        self.completed_recently
            .insert(execution_id.clone(), Instant::now());
        let me = Arc::clone(self);
        let prune_id = execution_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COMPLETED_RETENTION).await;
            me.completed_recently.remove(&prune_id);
        });

        if let Some((_, timer)) = self.grace_timers.remove(&execution_id) {
            timer.abort();
        }
        self.inflight.remove(&execution_id);
        if let Some(command_id) = command_id {
            self.inflight.remove(command_id);
        }

        if let Some(state_arc) = self.jobs.get(&job_id).map(|e| e.value().clone()) {
            let mut state = state_arc.lock().await;
            self.apply_terminal(&mut state, &execution_id, status, exit_code, error)
                .await;
            self.advance_locked(&mut state).await;
            self.finalize_locked(&mut state).await;
        } else if let Err(e) = self
            .store
            .mark_execution_terminal(&execution_id, status, exit_code, error, Utc::now())
            .await
        {
            warn!(execution_id = %execution_id, error = %e, "store write failed");
        }
    }

    // ── Disconnect grace ────────────────────────────────────────

    /// Arms a grace timer for every inflight execution owned by the
    /// disconnected agent instead of failing them outright; completion and
    /// disconnect frequently interleave.
    pub fn handle_agent_disconnect(self: &Arc<Self>, machine_id: &str) {
        let entries: Vec<InflightEntry> = self
            .inflight
            .iter()
            .filter(|e| e.machine_id == machine_id)
            .map(|e| e.value().clone())
            .collect();

        for entry in entries {
            if self.grace_timers.contains_key(&entry.execution_id) {
                continue;
            }
            info!(
                machine_id,
                execution_id = %entry.execution_id,
                grace_secs = self.grace.as_secs(),
                "agent disconnected with inflight execution, arming grace timer"
            );
            let me = Arc::clone(self);
            let execution_id = entry.execution_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(me.grace).await;
                me.expire_after_grace(entry).await;
            });
            self.grace_timers.insert(execution_id, handle);
        }
    }

    async fn expire_after_grace(self: &Arc<Self>, entry: InflightEntry) {
        self.grace_timers.remove(&entry.execution_id);

        if self.completed_recently.contains_key(&entry.execution_id) {
            return;
        }
        match self.store.execution_by_id(&entry.execution_id).await {
            Ok(Some(row)) if row.status.is_terminal() => return,
            Ok(_) => {}
            Err(e) => {
                warn!(execution_id = %entry.execution_id, error = %e, "store read failed");
                return;
            }
        }

        self.inflight.remove(&entry.execution_id);
        if let Some(state_arc) = self.jobs.get(&entry.job_id).map(|e| e.value().clone()) {
            let mut state = state_arc.lock().await;
            self.apply_terminal(
                &mut state,
                &entry.execution_id,
                ExecutionStatus::Failed,
                None,
                Some("Agent disconnected".into()),
            )
            .await;
            self.advance_locked(&mut state).await;
            self.finalize_locked(&mut state).await;
        } else if let Err(e) = self
            .store
            .mark_execution_terminal(
                &entry.execution_id,
                ExecutionStatus::Failed,
                None,
                Some("Agent disconnected".into()),
                Utc::now(),
            )
            .await
        {
            warn!(execution_id = %entry.execution_id, error = %e, "store write failed");
        }
    }

    // ── Abort ───────────────────────────────────────────────────

    /// Stops the rolling timer, skips every still-queued execution, and
    /// marks the job aborted. Inflight executions complete naturally.
    pub async fn abort_job(self: &Arc<Self>, job_id: &str, reason: &str) -> bool {
        let Some(state_arc) = self.jobs.get(job_id).map(|e| e.value().clone()) else {
            return false;
        };
        let mut state = state_arc.lock().await;
        if state.finalized || state.aborted {
            return false;
        }

        state.aborted = true;
        state.status = JobStatus::Aborted;
        if let Some(r) = state.rolling.as_mut() {
            if let Some(timer) = r.timer.take() {
                timer.abort();
            }
            r.waiting = false;
        }
        self.skip_queued(&mut state, reason).await;

        if let Err(e) = self
            .store
            .update_job_status(job_id, JobStatus::Aborted, None, Some(Utc::now()))
            .await
        {
            warn!(job_id, error = %e, "store write failed");
        }
        info!(job_id, reason, "job aborted");
        self.bus.publish(ServerEvent::JobUpdated {
            job: progress(&state),
        });
        self.finalize_locked(&mut state).await;
        true
    }

    async fn publish_progress_for(&self, job_id: &str) {
        if let Some(state_arc) = self.jobs.get(job_id).map(|e| e.value().clone()) {
            let state = state_arc.lock().await;
            self.bus.publish(ServerEvent::JobUpdated {
                job: progress(&state),
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

fn progress(state: &JobState) -> JobProgress {
    JobProgress {
        job_id: state.job_id.clone(),
        status: state.status,
        total_targets: state.total,
        succeeded: state.counts.success,
        failed: state.counts.failed,
        skipped: state.counts.skipped,
        running: state.running.len(),
    }
}

/// Batch size for a rolling job: explicit size wins, then a percentage of
/// the total, then the degenerate one-at-a-time batch.
fn batch_size(strategy: &StrategyOptions, total: usize) -> usize {
    if let Some(size) = strategy.batch_size {
        return size.max(1);
    }
    if let Some(percent) = strategy.batch_percent {
        return (((total as f64) * percent / 100.0).ceil() as usize).max(1);
    }
    1
}

fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        s.to_string()
    } else {
        s.chars().skip(count - n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::Machine;
    use fleet_protocol::MachineStatus;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FakeDispatcher {
        online: Mutex<HashSet<String>>,
        accept: bool,
        sent: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeDispatcher {
        fn new(online: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                online: Mutex::new(online.iter().map(|s| s.to_string()).collect()),
                accept: true,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, String, String)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl CommandDispatcher for FakeDispatcher {
        async fn send_command(&self, machine_id: &str, command_id: &str, command: &str) -> bool {
            if !self.accept {
                return false;
            }
            self.sent.lock().push((
                machine_id.to_string(),
                command_id.to_string(),
                command.to_string(),
            ));
            true
        }

        fn is_machine_online(&self, machine_id: &str) -> bool {
            self.online.lock().contains(machine_id)
        }
    }

    struct Harness {
        orch: Arc<JobOrchestrator>,
        store: Arc<MemoryStore>,
        dispatcher: Arc<FakeDispatcher>,
    }

    async fn harness(machines: &[&str], online: &[&str]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(StateCache::new());
        for id in machines {
            let machine = Machine {
                id: id.to_string(),
                hostname: format!("host-{id}"),
                ip: "10.0.0.1".into(),
                os_info: "linux".into(),
                status: if online.contains(id) {
                    MachineStatus::Online
                } else {
                    MachineStatus::Offline
                },
                last_seen: Utc::now(),
                encrypted_secret: String::new(),
                secret_hash: String::new(),
                role: None,
                tags: HashMap::new(),
                notes: None,
            };
            store.upsert_machine(machine.clone()).await.unwrap();
            cache.upsert_machine(machine);
        }
        let orch = Arc::new(JobOrchestrator::new(
            store.clone() as Arc<dyn Store>,
            cache,
            EventBus::new(),
            Duration::from_secs(15),
            50,
        ));
        let dispatcher = FakeDispatcher::new(online);
        orch.set_dispatcher(dispatcher.clone());
        Harness {
            orch,
            store,
            dispatcher,
        }
    }

    fn adhoc(ids: &[&str]) -> TargetSpec {
        TargetSpec::Adhoc {
            machine_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn request(mode: JobMode, targets: TargetSpec, strategy: StrategyOptions) -> JobRequest {
        JobRequest {
            command: "uptime".into(),
            mode,
            targets,
            strategy,
            created_by: Some("u1".into()),
        }
    }

    async fn execution_for(
        store: &MemoryStore,
        job_id: &str,
        machine_id: &str,
    ) -> ExecutionRow {
        store
            .executions_for_job(job_id)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.machine_id == machine_id)
            .unwrap()
    }

    #[tokio::test]
    async fn parallel_job_with_one_offline_target() {
        let h = harness(&["m1", "m2"], &["m1"]).await;
        let job = h
            .orch
            .submit(request(
                JobMode::Parallel,
                adhoc(&["m1", "m2"]),
                StrategyOptions {
                    concurrency: Some(10),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        // m2 failed immediately; m1 was dispatched.
        let e2 = execution_for(&h.store, &job.id, "m2").await;
        assert_eq!(e2.status, ExecutionStatus::Failed);
        assert_eq!(e2.error.as_deref(), Some("Agent offline"));
        assert_eq!(h.dispatcher.sent().len(), 1);

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        h.orch
            .handle_command_response(
                "m1",
                Some(&e1.id),
                Some("up 3 days"),
                Some(0),
                true,
            )
            .await;

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        assert_eq!(e1.status, ExecutionStatus::Success);
        assert_eq!(e1.output, "up 3 days");

        let job = h.store.job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn parallel_concurrency_is_respected() {
        let ids: Vec<String> = (0..6).map(|i| format!("m{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let h = harness(&refs, &refs).await;

        let job = h
            .orch
            .submit(request(
                JobMode::Parallel,
                adhoc(&refs),
                StrategyOptions {
                    concurrency: Some(2),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert_eq!(h.dispatcher.sent().len(), 2);

        // Completing one refills the in-flight set.
        let first = h.dispatcher.sent()[0].clone();
        h.orch
            .handle_command_response(&first.0, Some(&first.1), None, Some(0), true)
            .await;
        assert_eq!(h.dispatcher.sent().len(), 3);

        // Drain the rest, completing each dispatch exactly once.
        let mut done: HashSet<String> = HashSet::new();
        done.insert(first.1);
        loop {
            let fresh: Vec<(String, String, String)> = h
                .dispatcher
                .sent()
                .into_iter()
                .filter(|(_, cid, _)| !done.contains(cid))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for (machine, cid, _) in fresh {
                done.insert(cid.clone());
                h.orch
                    .handle_command_response(&machine, Some(&cid), None, Some(0), true)
                    .await;
            }
        }
        assert_eq!(done.len(), 6);

        let job = h.store.job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn missing_exit_code_counts_as_success() {
        let h = harness(&["m1"], &["m1"]).await;
        let job = h
            .orch
            .submit(request(JobMode::Parallel, adhoc(&["m1"]), Default::default()))
            .await
            .unwrap();

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        h.orch
            .handle_command_response("m1", Some(&e1.id), Some("done"), None, true)
            .await;

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        assert_eq!(e1.status, ExecutionStatus::Success);
        let job = h.store.job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn failed_execution_captures_output_tail() {
        let h = harness(&["m1"], &["m1"]).await;
        let job = h
            .orch
            .submit(request(JobMode::Parallel, adhoc(&["m1"]), Default::default()))
            .await
            .unwrap();

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        h.orch
            .handle_command_response(
                "m1",
                Some(&e1.id),
                Some("command not found: uptimex"),
                Some(127),
                true,
            )
            .await;

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        assert_eq!(e1.status, ExecutionStatus::Failed);
        assert_eq!(e1.exit_code, Some(127));
        assert!(e1.error.unwrap().contains("uptimex"));
    }

    #[tokio::test]
    async fn response_without_command_id_falls_back_to_machine() {
        let h = harness(&["m1"], &["m1"]).await;
        let job = h
            .orch
            .submit(request(JobMode::Parallel, adhoc(&["m1"]), Default::default()))
            .await
            .unwrap();

        h.orch
            .handle_command_response("m1", None, Some("hello"), Some(0), true)
            .await;

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        assert_eq!(e1.status, ExecutionStatus::Success);
        assert_eq!(e1.output, "hello");
    }

    #[tokio::test]
    async fn rolling_batch_failure_threshold_aborts_remainder() {
        let ids: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let h = harness(&refs, &refs).await;

        let job = h
            .orch
            .submit(request(
                JobMode::Rolling,
                adhoc(&refs),
                StrategyOptions {
                    batch_size: Some(2),
                    stop_on_failure_percent: Some(50.0),
                    wait_seconds: Some(30),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        // Only the first batch was dispatched.
        let sent = h.dispatcher.sent();
        assert_eq!(sent.len(), 2);

        // Both batch members fail: 100% > 50% → remainder skipped.
        for (machine, cid, _) in sent {
            h.orch
                .handle_command_response(&machine, Some(&cid), None, Some(1), true)
                .await;
        }

        let executions = h.store.executions_for_job(&job.id).await.unwrap();
        let skipped: Vec<&ExecutionRow> = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 8);
        assert!(skipped
            .iter()
            .all(|e| e.error.as_deref() == Some("Batch failure threshold exceeded")));

        let job = h.store.job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Aborted);
        // No further dispatches happened.
        assert_eq!(h.dispatcher.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_waits_between_batches() {
        let h = harness(&["m1", "m2"], &["m1", "m2"]).await;
        let job = h
            .orch
            .submit(request(
                JobMode::Rolling,
                adhoc(&["m1", "m2"]),
                StrategyOptions {
                    batch_size: Some(1),
                    wait_seconds: Some(10),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert_eq!(h.dispatcher.sent().len(), 1);
        let first = h.dispatcher.sent()[0].clone();
        h.orch
            .handle_command_response(&first.0, Some(&first.1), None, Some(0), true)
            .await;

        // Batch two must not launch before the wait elapses.
        assert_eq!(h.dispatcher.sent().len(), 1);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.dispatcher.sent().len(), 2);

        let second = h.dispatcher.sent()[1].clone();
        h.orch
            .handle_command_response(&second.0, Some(&second.1), None, Some(0), true)
            .await;
        let job = h.store.job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn rolling_defaults_to_batch_of_one() {
        let h = harness(&["m1", "m2"], &["m1", "m2"]).await;
        h.orch
            .submit(request(
                JobMode::Rolling,
                adhoc(&["m1", "m2"]),
                Default::default(),
            ))
            .await
            .unwrap();
        assert_eq!(h.dispatcher.sent().len(), 1);
    }

    #[tokio::test]
    async fn abort_skips_queued_and_lets_inflight_finish() {
        let ids: Vec<String> = (0..4).map(|i| format!("m{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let h = harness(&refs, &refs).await;

        let job = h
            .orch
            .submit(request(
                JobMode::Parallel,
                adhoc(&refs),
                StrategyOptions {
                    concurrency: Some(1),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        assert_eq!(h.dispatcher.sent().len(), 1);

        assert!(h.orch.abort_job(&job.id, "operator abort").await);

        let executions = h.store.executions_for_job(&job.id).await.unwrap();
        assert_eq!(
            executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Skipped)
                .count(),
            3
        );

        // The inflight execution completes naturally afterwards.
        let inflight = h.dispatcher.sent()[0].clone();
        h.orch
            .handle_command_response(&inflight.0, Some(&inflight.1), None, Some(0), true)
            .await;
        let row = h.store.execution_by_id(&inflight.1).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Success);

        let job = h.store.job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_grace_fails_silent_executions() {
        let h = harness(&["m1"], &["m1"]).await;
        let job = h
            .orch
            .submit(request(JobMode::Parallel, adhoc(&["m1"]), Default::default()))
            .await
            .unwrap();

        h.orch.handle_agent_disconnect("m1");
        tokio::time::sleep(Duration::from_millis(15_100)).await;

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        assert_eq!(e1.status, ExecutionStatus::Failed);
        assert_eq!(e1.error.as_deref(), Some("Agent disconnected"));
        let job = h.store.job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(h.orch.inflight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_just_before_grace_expiry_wins() {
        let h = harness(&["m1"], &["m1"]).await;
        let job = h
            .orch
            .submit(request(JobMode::Parallel, adhoc(&["m1"]), Default::default()))
            .await
            .unwrap();
        let e1 = execution_for(&h.store, &job.id, "m1").await;

        h.orch.handle_agent_disconnect("m1");
        tokio::time::sleep(Duration::from_millis(14_900)).await;
        h.orch
            .handle_command_response("m1", Some(&e1.id), None, Some(0), true)
            .await;
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        assert_eq!(e1.status, ExecutionStatus::Success);
        let job = h.store.job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_then_disconnect_interleave_stays_success() {
        let h = harness(&["m1"], &["m1"]).await;
        let job = h
            .orch
            .submit(request(JobMode::Parallel, adhoc(&["m1"]), Default::default()))
            .await
            .unwrap();
        let e1 = execution_for(&h.store, &job.id, "m1").await;

        // Completion lands, then the TCP connection tears down moments
        // later; the grace timer must find the completed marker.
        h.orch
            .handle_command_response("m1", Some(&e1.id), None, Some(0), true)
            .await;
        h.orch.handle_agent_disconnect("m1");
        tokio::time::sleep(Duration::from_secs(16)).await;

        let e1 = execution_for(&h.store, &job.id, "m1").await;
        assert_eq!(e1.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn empty_target_set_finishes_immediately() {
        let h = harness(&[], &[]).await;
        let job = h
            .orch
            .submit(request(JobMode::Parallel, adhoc(&[]), Default::default()))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.total_targets, 0);
    }

    #[tokio::test]
    async fn execution_accounting_closes_at_completion() {
        let h = harness(&["m1", "m2", "m3"], &["m1", "m3"]).await;
        let job = h
            .orch
            .submit(request(
                JobMode::Parallel,
                adhoc(&["m1", "m2", "m3"]),
                Default::default(),
            ))
            .await
            .unwrap();

        for machine in ["m1", "m3"] {
            let e = execution_for(&h.store, &job.id, machine).await;
            h.orch
                .handle_command_response(machine, Some(&e.id), None, Some(0), true)
                .await;
        }

        let executions = h.store.executions_for_job(&job.id).await.unwrap();
        let success = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Success)
            .count();
        let failed = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .count();
        assert_eq!(success + failed, job.total_targets);
        assert_eq!(success, 2);
        assert_eq!(failed, 1);
    }
}
