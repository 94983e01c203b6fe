use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::engine::{ActivityOutcome, Engine};
use crate::error::{EngineResult, ErrorEnvelope};
use crate::model::{Task, TaskKind, WorkflowStatus};
use crate::queue::{ValidatingQueue, WorkMessage, WorkQueue};
use crate::registry::ActivityRegistry;
use crate::store::BlobStore;
use crate::time::TsMillis;

/// Default per-reservation lease window, long enough to cover most activity handlers while still
/// bounding how long a crashed worker can hold a task before another can pick it up.
const DEFAULT_LEASE_SECS: i64 = 60;
const DEFAULT_RESERVE_BATCH: usize = 16;

/// Orchestrates `Engine` ticks, activity execution, and queue dispatch — stateless, so a
/// serverless host can construct one per invocation (§4.5). Mirrors `gasoline`'s
/// `Worker::tick`/shutdown loop, generalized from a long-lived poller to a per-call helper.
pub struct Runner<S: BlobStore, Q: WorkQueue> {
    engine: Engine<S>,
    queue: ValidatingQueue<Q>,
    activities: ActivityRegistry,
    worker_id: String,
}

impl<S: BlobStore, Q: WorkQueue> Runner<S, Q> {
    pub fn new(engine: Engine<S>, queue: ValidatingQueue<Q>, activities: ActivityRegistry, worker_id: impl Into<String>) -> Self {
        Self {
            engine,
            queue,
            activities,
            worker_id: worker_id.into(),
        }
    }

    /// Reserves and locally executes every ready `exec` task for a workflow, looping until none
    /// remain ready (§4.5). Each completion re-ticks so the decider can react within the same
    /// call rather than waiting for an external nudge.
    #[tracing::instrument(skip(self), fields(wf_id))]
    pub async fn drain_execs(&self, wf_id: &str, t_now: TsMillis) -> EngineResult<()> {
        loop {
            let reserved = self
                .engine
                .reserve_ready_activities(wf_id, &self.worker_id, DEFAULT_RESERVE_BATCH, DEFAULT_LEASE_SECS, t_now)
                .await?;

            if reserved.is_empty() {
                return Ok(());
            }

            let mut in_flight: FuturesUnordered<_> = reserved
                .iter()
                .map(|task| self.execute_and_complete(wf_id, task, t_now))
                .collect();
            while let Some(result) = in_flight.next().await {
                result?;
            }

            self.engine.tick(wf_id, t_now).await?;
        }
    }

    /// Runs a workflow to a terminal state, assuming the caller steps `t_now` forward itself
    /// (tests) or the caller is invoked again at `next_wake` (production, via an external
    /// scheduler — the runner never sleeps internally).
    #[tracing::instrument(skip(self), fields(wf_id))]
    pub async fn run_to_completion(&self, wf_id: &str, t_now: TsMillis) -> EngineResult<WorkflowStatus> {
        loop {
            let tick = self.engine.tick(wf_id, t_now).await?;
            if tick.status != WorkflowStatus::Running {
                return Ok(tick.status);
            }

            self.drain_execs(wf_id, t_now).await?;

            let tick = self.engine.tick(wf_id, t_now).await?;
            if tick.status != WorkflowStatus::Running {
                return Ok(tick.status);
            }
            if tick.next_wake.is_none() {
                // Nothing pending and not terminal: the workflow is stuck awaiting an external
                // signal. The caller must deliver one; there is nothing more to drive here.
                return Ok(tick.status);
            }
        }
    }

    /// The single-message path used by queue workers: reserve exactly the named task (if it is
    /// still ready), execute it, complete it, then tick so the decider reacts.
    #[tracing::instrument(skip(self), fields(wf_id, task_id))]
    pub async fn process_work_message(&self, wf_id: &str, task_id: &str, t_now: TsMillis) -> EngineResult<()> {
        let state = self.engine.get(wf_id).await?;
        let Some(task) = state.tasks.get(task_id) else {
            return Ok(());
        };
        if task.status != crate::model::TaskStatus::Pending || task.run_after > t_now || !task.is_exec() {
            return Ok(());
        }

        let reserved = self
            .engine
            .reserve_ready_activities(wf_id, &self.worker_id, 1, DEFAULT_LEASE_SECS, t_now)
            .await?;

        for task in &reserved {
            if task.id == task_id {
                self.execute_and_complete(wf_id, task, t_now).await?;
            }
        }

        self.engine.tick(wf_id, t_now).await?;
        Ok(())
    }

    /// Pulls nudges off the queue and processes each one, deleting the message once the
    /// corresponding task has been driven to completion or found already handled.
    #[tracing::instrument(skip(self))]
    pub async fn drain_queue(&self, max: usize, wait_seconds: u64, t_now: TsMillis, cancel: &CancellationToken) -> EngineResult<usize> {
        let messages = self
            .queue
            .receive_valid(max, wait_seconds, cancel)
            .await
            .map_err(|err| crate::error::EngineError::InvalidCommand(err.to_string()))?;

        let mut processed = 0;
        for (raw, WorkMessage { wf_id, task_id }) in messages {
            self.process_work_message(&wf_id, &task_id, t_now).await?;
            self.queue
                .delete(&raw.id, &raw.receipt, cancel)
                .await
                .map_err(|err| crate::error::EngineError::InvalidCommand(err.to_string()))?;
            processed += 1;
        }

        Ok(processed)
    }

    /// Enqueues a nudge for a specific task, e.g. right after `apply_commands` schedules it, so
    /// a pool of queue-driven workers can pick it up without polling the store.
    pub async fn nudge(&self, wf_id: &str, task_id: &str, cancel: &CancellationToken) -> EngineResult<()> {
        self.queue
            .send(
                &WorkMessage {
                    wf_id: wf_id.to_string(),
                    task_id: task_id.to_string(),
                },
                cancel,
            )
            .await
            .map_err(|err| crate::error::EngineError::InvalidCommand(err.to_string()))
    }

    async fn execute_and_complete(&self, wf_id: &str, task: &Task, t_now: TsMillis) -> EngineResult<()> {
        let TaskKind::Exec { code, lease, .. } = &task.kind else {
            return Ok(());
        };
        let Some(lease) = lease else { return Ok(()) };

        let action = code.get("action").and_then(Value::as_str).unwrap_or_default();
        let input = code.get("input").cloned().unwrap_or(Value::Null);

        let outcome = match self.activities.get(action) {
            Some(handler) => match handler(input).await {
                Ok(value) => ActivityOutcome::Success(value),
                Err(envelope) => ActivityOutcome::Failure(envelope),
            },
            None => ActivityOutcome::Failure(ErrorEnvelope::non_retryable(format!(
                "no activity registered for action {action}"
            ))),
        };

        self.engine
            .complete_activity(wf_id, &task.id, outcome, lease.token, t_now)
            .await?;
        Ok(())
    }
}

use crate::registry::Registry;

/// Convenience constructor used by tests: an in-memory `Runner` over the in-memory store/queue.
pub fn in_memory_runner(
    registry: Registry,
    activities: ActivityRegistry,
    worker_id: impl Into<String>,
) -> Runner<crate::store::memory::InMemoryBlobStore, crate::queue::memory::InMemoryQueue> {
    let store = Arc::new(crate::store::memory::InMemoryBlobStore::new());
    let engine = Engine::new(store, registry, "wf/");
    let queue = ValidatingQueue::new(crate::queue::memory::InMemoryQueue::new());
    Runner::new(engine, queue, activities, worker_id)
}
