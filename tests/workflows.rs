use std::sync::Arc;

use flowkeep::engine::{ActivityOutcome, CompleteOutcome, Engine};
use flowkeep::error::ErrorEnvelope;
use flowkeep::interpreter::{decide, Decider, EffectDesc, ExecOpts, Io, Suspend};
use flowkeep::model::{EventData, TaskStatus, WorkflowStatus};
use flowkeep::registry::Registry;
use flowkeep::store::memory::InMemoryBlobStore;
use serde_json::{json, Value};

fn hello_decider() -> Decider {
    Box::new(|io: &mut Io, params: &Value| -> Result<(), Suspend> {
        let start = params.get("start").and_then(Value::as_i64).unwrap_or(0);
        let mut i = io.get("i").and_then(Value::as_i64).unwrap_or(start);

        while i < 3 {
            let result = io.exec("increment", json!({ "to": i + 1 }), ExecOpts::default())?;
            let to = result.get("to").and_then(Value::as_i64).unwrap_or(i + 1);
            io.set("i", json!(to))?;
            io.sleep(2)?;
            i = to;
        }

        io.complete(Some(json!({ "final": i })))?;
        Ok(())
    })
}

fn always_fail_decider(retry_delays: Option<Vec<u64>>, max_tries: Option<u32>) -> Decider {
    Box::new(move |io: &mut Io, _params: &Value| -> Result<(), Suspend> {
        let mut opts = ExecOpts::default();
        opts.retry_delays = retry_delays.clone();
        opts.max_tries = max_tries;
        io.exec("always_fail", json!({}), opts)?;
        io.complete(None)?;
        Ok(())
    })
}

fn race_decider() -> Decider {
    Box::new(|io: &mut Io, _params: &Value| -> Result<(), Suspend> {
        let (winner, _value) = io.race(vec![
            ("sig".to_string(), EffectDesc::signal("S")),
            ("slow".to_string(), EffectDesc::exec("slow", json!({}), ExecOpts::default())),
        ])?;
        io.set("winner", json!(winner))?;
        io.complete(None)?;
        Ok(())
    })
}

fn fan_out_decider() -> Decider {
    Box::new(|io: &mut Io, _params: &Value| -> Result<(), Suspend> {
        let results = io.all(vec![
            EffectDesc::exec("double", json!({ "n": 1 }), ExecOpts::default()),
            EffectDesc::exec("double", json!({ "n": 2 }), ExecOpts::default()),
        ])?;
        io.set("sum", json!(results.iter().filter_map(Value::as_i64).sum::<i64>()))?;
        io.complete(None)?;
        Ok(())
    })
}

fn explicit_fail_decider() -> Decider {
    Box::new(|io: &mut Io, _params: &Value| -> Result<(), Suspend> {
        io.fail(Some("not going to happen".to_string()))?;
        Ok(())
    })
}

fn single_exec_decider() -> Decider {
    Box::new(|io: &mut Io, _params: &Value| -> Result<(), Suspend> {
        io.exec("noop", json!({}), ExecOpts::default())?;
        io.complete(None)?;
        Ok(())
    })
}

fn make_engine(registry: Registry) -> Engine<InMemoryBlobStore> {
    Engine::new(Arc::new(InMemoryBlobStore::new()), registry, "wf/")
}

/// Seed scenario 1 (§8): a counting loop via exec/set/sleep, completing with the final count.
#[tokio::test]
async fn hello_counts_to_three_and_completes() {
    let mut registry = Registry::new();
    registry.register("hello", hello_decider());
    let engine = make_engine(registry);

    let mut t = 0i64;
    engine.create("wf1", "hello", json!({ "start": 0 }), t).await.unwrap();

    for i in 0..3i64 {
        engine.tick("wf1", t).await.unwrap(); // schedules exec
        let reserved = engine
            .reserve_ready_activities("wf1", "w1", 10, 60, t)
            .await
            .unwrap();
        assert_eq!(reserved.len(), 1);
        engine
            .complete_activity(
                "wf1",
                &reserved[0].id,
                ActivityOutcome::Success(json!({ "to": i + 1 })),
                reserved[0].lease().unwrap().token,
                t,
            )
            .await
            .unwrap();
        engine.tick("wf1", t).await.unwrap(); // schedules sleep
        t += 3_000;
        engine.tick("wf1", t).await.unwrap(); // fires timer
    }

    engine.tick("wf1", t).await.unwrap();
    let state = engine.get("wf1").await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.ctx["i"], json!(3));
    assert_eq!(state.ctx["result"], json!({ "final": 3 }));
}

/// Seed scenario 2: default backoff schedule is exactly [2, 4] before giving up at 3 tries.
#[tokio::test]
async fn backoff_schedule_is_two_then_four() {
    let mut registry = Registry::new();
    registry.register("backoff", always_fail_decider(None, None));
    let engine = make_engine(registry);

    let mut t = 0i64;
    engine.create("wf2", "backoff", json!({}), t).await.unwrap();
    engine.tick("wf2", t).await.unwrap();

    let mut observed_backoffs = Vec::new();
    for _ in 0..3 {
        let reserved = engine.reserve_ready_activities("wf2", "w1", 10, 60, t).await.unwrap();
        assert_eq!(reserved.len(), 1);
        let task_id = reserved[0].id.clone();
        let token = reserved[0].lease().unwrap().token;
        engine
            .complete_activity(
                "wf2",
                &task_id,
                ActivityOutcome::Failure(ErrorEnvelope::retryable("boom")),
                token,
                t,
            )
            .await
            .unwrap();

        let state = engine.get("wf2").await.unwrap();
        if let Some(EventData::ActivityRetry { after_seconds, .. }) = state.history.last().map(|e| &e.data) {
            observed_backoffs.push(*after_seconds);
            t += (*after_seconds as i64) * 1000 + 1_000;
        }
        engine.tick("wf2", t).await.unwrap();
    }

    assert_eq!(observed_backoffs, vec![2, 4]);
    let state = engine.get("wf2").await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert!(matches!(state.history.last().unwrap().data, EventData::WfFailed { .. }));
}

/// Seed scenario 3: per-call `retry_delays` override the schedule even though it never varies
/// with a workflow-level default in this crate (there is no such default to override here, only
/// the engine's built-in `min(300, 2^tries)` — the override itself is what's under test).
#[tokio::test]
async fn per_call_retry_delays_override_defaults() {
    let mut registry = Registry::new();
    registry.register("backoff2", always_fail_decider(Some(vec![2, 2]), Some(3)));
    let engine = make_engine(registry);

    let mut t = 0i64;
    engine.create("wf3", "backoff2", json!({}), t).await.unwrap();
    engine.tick("wf3", t).await.unwrap();

    let mut observed = Vec::new();
    for _ in 0..3 {
        let reserved = engine.reserve_ready_activities("wf3", "w1", 10, 60, t).await.unwrap();
        let task_id = reserved[0].id.clone();
        let token = reserved[0].lease().unwrap().token;
        engine
            .complete_activity(
                "wf3",
                &task_id,
                ActivityOutcome::Failure(ErrorEnvelope::retryable("boom")),
                token,
                t,
            )
            .await
            .unwrap();
        let state = engine.get("wf3").await.unwrap();
        if let Some(EventData::ActivityRetry { after_seconds, .. }) = state.history.last().map(|e| &e.data) {
            observed.push(*after_seconds);
            t += (*after_seconds as i64) * 1000 + 1_000;
        }
        engine.tick("wf3", t).await.unwrap();
    }

    assert_eq!(observed, vec![2, 2]);
}

/// Seed scenario 4: a completion with a stale fencing token is a silent no-op; the correct token
/// succeeds exactly once.
#[tokio::test]
async fn lease_fencing_rejects_stale_tokens() {
    let mut registry = Registry::new();
    registry.register("fence", single_exec_decider());
    let engine = make_engine(registry);

    let t = 0i64;
    engine.create("wf4", "fence", json!({}), t).await.unwrap();
    engine.tick("wf4", t).await.unwrap();
    let reserved = engine.reserve_ready_activities("wf4", "w1", 10, 60, t).await.unwrap();
    let task_id = reserved[0].id.clone();
    let real_token = reserved[0].lease().unwrap().token;

    let stale = engine
        .complete_activity("wf4", &task_id, ActivityOutcome::Success(json!(null)), real_token + 1, t)
        .await
        .unwrap();
    assert_eq!(stale, CompleteOutcome::Already);

    let state = engine.get("wf4").await.unwrap();
    assert_eq!(state.tasks[&task_id].status, TaskStatus::Leased);

    let applied = engine
        .complete_activity("wf4", &task_id, ActivityOutcome::Success(json!(null)), real_token, t)
        .await
        .unwrap();
    assert_eq!(applied, CompleteOutcome::Applied);

    let again = engine
        .complete_activity("wf4", &task_id, ActivityOutcome::Success(json!(null)), real_token, t)
        .await
        .unwrap();
    assert_eq!(again, CompleteOutcome::Already);
}

/// Seed scenario 5: a lease that expires can be re-reserved by another worker with a strictly
/// greater fencing token.
#[tokio::test]
async fn expired_lease_is_reissued_with_a_higher_token() {
    let mut registry = Registry::new();
    registry.register("expiry", single_exec_decider());
    let engine = make_engine(registry);

    let t0 = 0i64;
    engine.create("wf5", "expiry", json!({}), t0).await.unwrap();
    engine.tick("wf5", t0).await.unwrap();

    let first = engine
        .reserve_ready_activities("wf5", "w1", 10, 1, t0)
        .await
        .unwrap();
    let token1 = first[0].lease().unwrap().token;

    let t1 = t0 + 2_000;
    let second = engine
        .reserve_ready_activities("wf5", "w2", 10, 60, t1)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    let token2 = second[0].lease().unwrap().token;
    assert!(token2 > token1);
}

/// Seed scenario 6: a signal delivered before the competing exec completes wins the race.
#[tokio::test]
async fn race_picks_the_earliest_signal_over_a_slow_exec() {
    let mut registry = Registry::new();
    registry.register("race", race_decider());
    let engine = make_engine(registry);

    let t = 0i64;
    engine.create("wf6", "race", json!({}), t).await.unwrap();
    engine.tick("wf6", t).await.unwrap(); // schedules the "slow" exec, nothing wins yet

    engine.signal("wf6", "S", json!("go"), t).await.unwrap();
    engine.tick("wf6", t).await.unwrap();

    let state = engine.get("wf6").await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.ctx["winner"], json!("sig"));
}

/// `all` fans both children out in the same tick and only resumes once both have completed,
/// regardless of completion order.
#[tokio::test]
async fn all_waits_for_every_child_before_resuming() {
    let mut registry = Registry::new();
    registry.register("fanout", fan_out_decider());
    let engine = make_engine(registry);

    let t = 0i64;
    engine.create("wf8", "fanout", json!({}), t).await.unwrap();
    engine.tick("wf8", t).await.unwrap(); // schedules both execs

    let reserved = engine.reserve_ready_activities("wf8", "w1", 10, 60, t).await.unwrap();
    assert_eq!(reserved.len(), 2);

    // Complete them out of id order to confirm the result is keyed by effect position, not
    // completion order.
    let mut reserved = reserved;
    reserved.reverse();
    for task in &reserved {
        engine
            .complete_activity(
                "wf8",
                &task.id,
                ActivityOutcome::Success(json!(7)),
                task.lease().unwrap().token,
                t,
            )
            .await
            .unwrap();
        // Only one child done so far on the first iteration: the decider must still wait.
        engine.tick("wf8", t).await.unwrap();
    }

    let state = engine.get("wf8").await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.ctx["sum"], json!(14));
}

/// A decider that calls `fail` directly terminates the workflow without ever scheduling a task.
#[tokio::test]
async fn explicit_fail_terminates_with_no_tasks_scheduled() {
    let mut registry = Registry::new();
    registry.register("explicit_fail", explicit_fail_decider());
    let engine = make_engine(registry);

    let t = 0i64;
    engine.create("wf9", "explicit_fail", json!({}), t).await.unwrap();
    engine.tick("wf9", t).await.unwrap();

    let state = engine.get("wf9").await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert!(state.tasks.is_empty());
    assert!(matches!(
        state.history.last().unwrap().data,
        EventData::WfFailed { ref reason } if reason.message == "not going to happen"
    ));
}

/// Law: replaying the decider against an unchanged history produces no new scheduling commands.
#[tokio::test]
async fn replay_on_unchanged_history_is_a_no_op() {
    let mut registry = Registry::new();
    registry.register("fence", single_exec_decider());
    let engine = make_engine(registry);

    let t = 0i64;
    engine.create("wf7", "fence", json!({}), t).await.unwrap();
    engine.tick("wf7", t).await.unwrap();

    let state = engine.get("wf7").await.unwrap();
    let decider = registry_lookup();
    let commands = decide(&decider, &state, t);
    assert!(commands.iter().all(|c| matches!(c, flowkeep::model::Command::Set { .. })));

    fn registry_lookup() -> Decider {
        single_exec_decider()
    }
}
