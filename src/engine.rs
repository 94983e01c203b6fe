use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult, ErrorEnvelope, ErrorKind, StoreError};
use crate::interpreter::decide;
use crate::metrics;
use crate::model::{
    default_max_tries, set_dot_path, Command, EventData, Lease, Task, TaskKind, TaskStatus,
    WorkflowState, WorkflowStatus,
};
use crate::registry::Registry;
use crate::store::BlobStore;
use crate::time::TsMillis;

/// `Engine`'s own public operations are not individually cancellable (only `BlobStore`'s are,
/// per §4.1/§5); each internal store call gets a token that is never cancelled so the `BlobStore`
/// implementation's cooperative cancellation check always takes the "proceed" branch here.
fn no_cancel() -> CancellationToken {
    CancellationToken::new()
}

/// Bounds the CAS retry loop every public operation wraps itself in (§5 "Backpressure"),
/// mirroring `gasoline`'s `MAX_DB_ACTION_RETRIES`.
const MAX_CAS_RETRIES: u32 = 16;

/// The result of `complete_activity` (§4.3.4): distinguishes a state-changing completion from a
/// stale, no-op one so callers (the runner) can decide whether to re-tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Applied,
    Already,
}

/// What an activity handler reports back to `complete_activity`.
#[derive(Debug, Clone)]
pub enum ActivityOutcome {
    Success(Value),
    Failure(ErrorEnvelope),
}

/// Advances exactly one workflow per call, atomically, under optimistic concurrency (§4.3, §5).
/// Holds no per-workflow state of its own; everything lives in the `BlobStore`.
pub struct Engine<S: BlobStore> {
    store: Arc<S>,
    registry: Registry,
    prefix: String,
}

impl<S: BlobStore> Engine<S> {
    pub fn new(store: Arc<S>, registry: Registry, prefix: impl Into<String>) -> Self {
        Self {
            store,
            registry,
            prefix: prefix.into(),
        }
    }

    fn key(&self, wf_id: &str) -> String {
        format!("{}{}", self.prefix, wf_id)
    }

    /// §4.3.1: initializes a new workflow, failing if one already exists at this id.
    #[tracing::instrument(skip(self, initial_ctx), fields(wf_id))]
    pub async fn create(
        &self,
        wf_id: &str,
        decider_name: &str,
        initial_ctx: Value,
        t_now: TsMillis,
    ) -> EngineResult<()> {
        let key = self.key(wf_id);

        if self.store.get(&key, &no_cancel()).await?.is_some() {
            return Err(EngineError::AlreadyExists(wf_id.to_string()));
        }

        let mut state = WorkflowState::new(wf_id.to_string(), decider_name.to_string(), initial_ctx, t_now);
        state.push_event(
            t_now,
            EventData::WfCreated {
                decider: decider_name.to_string(),
            },
        );

        match self.store.put(&key, &state, None, &no_cancel()).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => Err(EngineError::AlreadyExists(wf_id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, wf_id: &str) -> EngineResult<WorkflowState> {
        self.store
            .get(&self.key(wf_id), &no_cancel())
            .await?
            .map(|record| record.state)
            .ok_or_else(|| EngineError::NotFound(wf_id.to_string()))
    }

    /// §4.3.2: fires due timers, runs the decider if needed, applies commands, recomputes
    /// `next_wake`, persists under CAS.
    #[tracing::instrument(skip(self), fields(wf_id))]
    pub async fn tick(&self, wf_id: &str, t_now: TsMillis) -> EngineResult<TickResult> {
        self.retry_cas(wf_id, |state| {
            let mut changed = false;

            for task in state.tasks.values_mut() {
                if let TaskKind::Sleep { .. } = &task.kind {
                    if task.status == TaskStatus::Pending && task.run_after <= t_now {
                        task.status = TaskStatus::Completed;
                        changed = true;
                        let task_id = task.id.clone();
                        state.need_decide = true;
                        state.push_event(t_now, EventData::TimerFired { task_id });
                    }
                }
            }

            if state.status == WorkflowStatus::Running && state.need_decide {
                if let Some(decider) = self.registry.get(&state.decider) {
                    let commands = decide(&decider, state, t_now);
                    apply_commands(state, commands, t_now)?;
                    changed = true;
                } else {
                    return Err(EngineError::UnknownDecider(state.decider.clone()));
                }
                state.need_decide = false;
            }

            state.next_wake = compute_next_wake(state);
            if changed {
                state.updated_at = t_now;
            }
            metrics::record_tick(&state.decider);

            Ok(TickResult {
                rev: state.rev,
                next_wake: state.next_wake,
                status: state.status,
            })
        })
        .await
    }

    /// §4.3.3: leases ready `exec` tasks in ascending (lexicographic) id order. Reserving when
    /// nothing is due (or `max_n == 0`) returns an empty result without writing (§8 boundary
    /// behavior) — checked with a plain read before entering the CAS loop.
    #[tracing::instrument(skip(self), fields(wf_id))]
    pub async fn reserve_ready_activities(
        &self,
        wf_id: &str,
        worker_id: &str,
        max_n: usize,
        lease_secs: i64,
        t_now: TsMillis,
    ) -> EngineResult<Vec<Task>> {
        let key = self.key(wf_id);
        let record = self
            .store
            .get(&key, &no_cancel())
            .await?
            .ok_or_else(|| EngineError::NotFound(wf_id.to_string()))?;
        if !has_ready_activity(&record.state, max_n, t_now) {
            return Ok(Vec::new());
        }

        self.retry_cas(wf_id, |state| {
            let mut reserved = Vec::new();

            for task in state.tasks.values_mut() {
                if reserved.len() >= max_n {
                    break;
                }
                if task.status.is_terminal() || !task.is_exec() {
                    continue;
                }
                if task.status == TaskStatus::Leased {
                    if let Some(lease) = task.lease() {
                        if lease.expires_at > t_now {
                            continue;
                        }
                    }
                }
                if task.run_after > t_now {
                    continue;
                }

                if let TaskKind::Exec { fence, lease, .. } = &mut task.kind {
                    *fence += 1;
                    *lease = Some(Lease {
                        owner: worker_id.to_string(),
                        token: *fence,
                        expires_at: t_now + lease_secs * 1000,
                        started_at: t_now,
                    });
                }
                task.status = TaskStatus::Leased;
                reserved.push(task.clone());
            }

            Ok(reserved)
        })
        .await
    }

    /// §4.3.4: records an activity outcome. Idempotent and fencing-checked — a stale or
    /// already-terminal task is a silent no-op (`CompleteOutcome::Already`), never a hard error.
    #[tracing::instrument(skip(self, outcome), fields(wf_id, task_id))]
    pub async fn complete_activity(
        &self,
        wf_id: &str,
        task_id: &str,
        outcome: ActivityOutcome,
        lease_token: u64,
        t_now: TsMillis,
    ) -> EngineResult<CompleteOutcome> {
        self.retry_cas(wf_id, |state| {
            let decider_name = state.decider.clone();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return Ok(CompleteOutcome::Already);
            };

            if task.status.is_terminal() {
                return Ok(CompleteOutcome::Already);
            }

            let matches = match task.lease() {
                Some(lease) => task.status == TaskStatus::Leased && lease.token == lease_token,
                None => false,
            };
            if !matches {
                return Ok(CompleteOutcome::Already);
            }

            let action = activity_action_name(task);
            let started_at = task.lease().map(|lease| lease.started_at);

            match outcome.clone() {
                ActivityOutcome::Success(value) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(value.clone());
                    if let TaskKind::Exec { lease, .. } = &mut task.kind {
                        *lease = None;
                    }
                    let task_id = task.id.clone();
                    state.need_decide = true;
                    state.push_event(t_now, EventData::ActivityCompleted { task_id, result: value });
                    let duration_secs = started_at
                        .map(|started| (t_now - started).max(0) as f64 / 1000.0)
                        .unwrap_or(0.0);
                    metrics::record_activity_duration(
                        &decider_name,
                        action.as_deref().unwrap_or(""),
                        "success",
                        duration_secs,
                    );
                }
                ActivityOutcome::Failure(error) => {
                    metrics::record_activity_error(&decider_name, action.as_deref().unwrap_or(""));
                    apply_activity_failure(state, task_id, error, t_now)?;
                }
            }

            Ok(CompleteOutcome::Applied)
        })
        .await
    }

    /// §4.3.5: extends an already-held lease. Hard errors (not retried) on any mismatch.
    #[tracing::instrument(skip(self), fields(wf_id, task_id))]
    pub async fn extend_lease(
        &self,
        wf_id: &str,
        task_id: &str,
        owner: &str,
        token: u64,
        extra_secs: i64,
        t_now: TsMillis,
    ) -> EngineResult<TsMillis> {
        self.retry_cas(wf_id, |state| {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::NotLeased {
                    task_id: task_id.to_string(),
                })?;

            if task.status != TaskStatus::Leased {
                return Err(EngineError::NotLeased {
                    task_id: task_id.to_string(),
                });
            }

            let TaskKind::Exec { lease, .. } = &mut task.kind else {
                return Err(EngineError::NotLeased {
                    task_id: task_id.to_string(),
                });
            };

            let lease = lease.as_mut().ok_or_else(|| EngineError::NotLeased {
                task_id: task_id.to_string(),
            })?;

            if lease.owner != owner || lease.token != token {
                return Err(EngineError::LeaseMismatch {
                    task_id: task_id.to_string(),
                });
            }
            if lease.expires_at < t_now {
                return Err(EngineError::LeaseExpired {
                    task_id: task_id.to_string(),
                });
            }

            lease.expires_at += extra_secs * 1000;
            Ok(lease.expires_at)
        })
        .await
    }

    /// §4.3.7: records a signal. Works regardless of workflow status (terminal workflows just
    /// produce no further tasks once the decider no-ops).
    #[tracing::instrument(skip(self, payload), fields(wf_id))]
    pub async fn signal(&self, wf_id: &str, name: &str, payload: Value, t_now: TsMillis) -> EngineResult<()> {
        self.retry_cas(wf_id, |state| {
            state.signals.push(crate::model::SignalRecord {
                ts: t_now,
                name: name.to_string(),
                payload: payload.clone(),
            });
            state.push_event(
                t_now,
                EventData::Signal {
                    name: name.to_string(),
                    payload: payload.clone(),
                },
            );
            state.need_decide = true;
            Ok(())
        })
        .await
    }

    async fn retry_cas<T>(
        &self,
        wf_id: &str,
        mut mutate: impl FnMut(&mut WorkflowState) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let key = self.key(wf_id);

        for _attempt in 0..MAX_CAS_RETRIES {
            let record = self
                .store
                .get(&key, &no_cancel())
                .await?
                .ok_or_else(|| EngineError::NotFound(wf_id.to_string()))?;
            let mut state = record.state;
            state.rev += 1;

            let result = mutate(&mut state)?;

            let was_running = state.status == WorkflowStatus::Running;
            match self.store.put(&key, &state, Some(&record.cas), &no_cancel()).await {
                Ok(rev) => {
                    if was_running && state.status != WorkflowStatus::Running {
                        metrics::record_workflow_terminal(&state.decider, status_label(state.status));
                    }
                    let _ = rev;
                    return Ok(result);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(EngineError::CasRetriesExhausted {
            key,
            attempts: MAX_CAS_RETRIES,
        })
    }
}

/// §4.3.6: applies a decider's commands to in-memory state.
pub fn apply_commands(state: &mut WorkflowState, commands: Vec<Command>, t_now: TsMillis) -> EngineResult<()> {
    if state.status.is_terminal() {
        return Ok(());
    }

    for command in commands {
        if state.status.is_terminal() {
            break;
        }

        match command {
            Command::Sleep { seconds, until, label } => {
                let run_after = match (seconds, until) {
                    (Some(s), None) => t_now + (s as i64) * 1000,
                    (None, Some(ts)) => ts,
                    _ => {
                        return Err(EngineError::InvalidCommand(
                            "sleep requires exactly one of seconds/until".to_string(),
                        ))
                    }
                };
                let task_id = state.next_task_id();
                state.tasks.insert(
                    task_id.clone(),
                    Task::new_sleep(task_id.clone(), run_after, label.clone()),
                );
                state.push_event(t_now, EventData::TimerScheduled { task_id, run_after, label });
            }
            Command::Exec {
                name,
                code,
                run_after,
                idem_key,
                max_tries,
                retry_delays,
            } => {
                let task_id = state.next_task_id();
                let run_after = run_after.unwrap_or(t_now);
                let max_tries = max_tries.unwrap_or_else(default_max_tries);
                let retry_delays = retry_delays.unwrap_or_default();
                state.tasks.insert(
                    task_id.clone(),
                    Task::new_exec(
                        task_id.clone(),
                        code,
                        name.clone(),
                        run_after,
                        idem_key,
                        max_tries,
                        retry_delays,
                    ),
                );
                state.push_event(t_now, EventData::ActivityScheduled { task_id, name });
            }
            Command::Set { key, value } => {
                set_dot_path(&mut state.ctx, &key, value);
                state.push_event(t_now, EventData::CtxSet { key });
            }
            Command::CompleteWorkflow => {
                state.status = WorkflowStatus::Completed;
                state.push_event(t_now, EventData::WfCompleted);
            }
            Command::FailWorkflow { reason } => {
                let error = ErrorEnvelope::non_retryable(reason.unwrap_or_else(|| "workflow failed".to_string()));
                state.status = WorkflowStatus::Failed;
                state.push_event(t_now, EventData::WfFailed { reason: error });
            }
        }
    }

    Ok(())
}

/// §4.3.4 failure branch, extracted so `complete_activity`'s retry closure stays readable.
/// Implements the REDESIGN FLAG: `non_retryable` failures short-circuit to `ActivityFailed`
/// immediately rather than waiting out `max_tries` (see DESIGN.md).
fn apply_activity_failure(
    state: &mut WorkflowState,
    task_id: &str,
    error: ErrorEnvelope,
    t_now: TsMillis,
) -> EngineResult<()> {
    let task = state
        .tasks
        .get_mut(task_id)
        .expect("task existence already checked by caller");

    let TaskKind::Exec {
        tries,
        max_tries,
        retry_delays,
        lease,
        ..
    } = &mut task.kind
    else {
        return Err(EngineError::InvalidCommand(format!("{task_id} is not an exec task")));
    };

    *tries += 1;
    let give_up = error.kind == ErrorKind::NonRetryable || *tries >= *max_tries;

    if give_up {
        task.status = TaskStatus::Failed;
        task.error = Some(error.clone());
        *lease = None;
        state.push_event(
            t_now,
            EventData::ActivityFailed {
                task_id: task_id.to_string(),
                error,
            },
        );
        state.status = WorkflowStatus::Failed;
    } else {
        let tries_now = *tries;
        let backoff = retry_delays
            .get((tries_now - 1) as usize)
            .copied()
            .unwrap_or_else(|| 2u64.saturating_pow(tries_now).min(300));

        task.status = TaskStatus::Pending;
        task.run_after = t_now + (backoff as i64) * 1000;
        task.error = Some(error.clone());
        *lease = None;
        state.push_event(
            t_now,
            EventData::ActivityRetry {
                task_id: task_id.to_string(),
                after_seconds: backoff,
                error,
            },
        );
        state.need_decide = true;
    }

    Ok(())
}

/// §4.3.2 step 3: earliest of every pending task's `run_after` and every leased task's
/// `expires_at`, or `None` if there is nothing outstanding.
fn compute_next_wake(state: &WorkflowState) -> Option<TsMillis> {
    let mut wake: Option<TsMillis> = None;
    let mut consider = |ts: TsMillis| {
        wake = Some(match wake {
            Some(existing) => existing.min(ts),
            None => ts,
        });
    };

    for task in state.tasks.values() {
        match task.status {
            TaskStatus::Pending => consider(task.run_after),
            TaskStatus::Leased => {
                if let Some(lease) = task.lease() {
                    consider(lease.expires_at);
                }
            }
            _ => {}
        }
    }

    wake
}

fn status_label(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Running => "running",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Cancelled => "cancelled",
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TickResult {
    pub rev: u64,
    pub next_wake: Option<TsMillis>,
    pub status: WorkflowStatus,
}

fn has_ready_activity(state: &WorkflowState, max_n: usize, t_now: TsMillis) -> bool {
    if max_n == 0 {
        return false;
    }
    state.tasks.values().any(|task| {
        if task.status.is_terminal() || !task.is_exec() {
            return false;
        }
        if task.status == TaskStatus::Leased {
            if let Some(lease) = task.lease() {
                if lease.expires_at > t_now {
                    return false;
                }
            }
        }
        task.run_after <= t_now
    })
}

fn activity_action_name(task: &Task) -> Option<String> {
    match &task.kind {
        TaskKind::Exec { code, .. } => code.get("action").and_then(Value::as_str).map(str::to_string),
        TaskKind::Sleep { .. } => None,
    }
}
