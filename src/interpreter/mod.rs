pub mod effect;
pub mod history_index;
pub mod io;

use serde_json::Value;

pub use effect::{EffectDesc, ExecOpts};
pub use history_index::HistoryIndex;
pub use io::{Io, Suspend};

use crate::model::{get_dot_path, set_dot_path, Command, WorkflowState};

/// A compiled workflow body: a plain function from `(io, params)` to nothing, which bails with
/// `Suspend` the moment it has nothing left to do this tick (§4.4). `params` is a read-only
/// snapshot of `ctx` as it stood when this tick's decide started — most bodies only need it once,
/// at the top, to recover the value the workflow was created with; later reads of live,
/// same-tick mutations go through `io.ctx()`/`io.get()` instead.
pub type Decider = Box<dyn Fn(&mut Io, &Value) -> Result<(), Suspend> + Send + Sync>;

/// Runs one decider invocation to completion-or-suspension and returns the commands it staged
/// (§4.3.2 step 2, §4.4 "Replay algorithm"). Pure and synchronous: no I/O, no clock reads beyond
/// the `t_now` the engine already pinned for this tick.
pub fn decide(decider: &Decider, state: &WorkflowState, t_now: crate::time::TsMillis) -> Vec<Command> {
    let history = HistoryIndex::build(state);

    let mut ctx_snapshot = state.ctx.clone();
    let wf_was_present = get_dot_path(&ctx_snapshot, "$wf").is_some();
    if !wf_was_present {
        set_dot_path(
            &mut ctx_snapshot,
            "$wf",
            serde_json::json!({"cursor": 0, "sigCount": {}}),
        );
    }

    let params = ctx_snapshot.clone();
    let mut io = Io::new(&history, ctx_snapshot, t_now);

    // The body's return value carries no information: whether it suspended waiting on an effect
    // or stopped after `complete`/`fail`, the staged commands are the entire observable result.
    let _ = decider(&mut io, &params);

    let final_cursor = io.cursor();
    let prior_cursor = get_dot_path(&params, "$wf.cursor").and_then(Value::as_u64).unwrap_or(0);

    let (mut sets, others) = io.into_parts();

    let mut prefix = Vec::new();
    if !wf_was_present {
        prefix.push(Command::Set {
            key: "$wf".to_string(),
            value: serde_json::json!({"cursor": 0, "sigCount": {}}),
        });
    }
    if final_cursor != prior_cursor {
        prefix.push(Command::Set {
            key: "$wf.cursor".to_string(),
            value: serde_json::json!(final_cursor),
        });
    }

    prefix.append(&mut sets);
    prefix.extend(others);
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowStatus;
    use serde_json::json;

    fn exec_once_decider() -> Decider {
        Box::new(|io: &mut Io, _params: &Value| -> Result<(), Suspend> {
            io.exec("noop", json!({}), ExecOpts::default())?;
            io.complete(None)?;
            Ok(())
        })
    }

    #[test]
    fn first_invocation_stages_wf_init_and_exec_schedule() {
        let decider = exec_once_decider();
        let state = WorkflowState::new("wf".into(), "d".into(), json!({}), 0);

        let commands = decide(&decider, &state, 0);

        assert!(matches!(&commands[0], Command::Set { key, .. } if key == "$wf"));
        assert!(matches!(&commands[1], Command::Set { key, .. } if key == "$wf.cursor"));
        assert!(matches!(&commands[2], Command::Exec { name: Some(n), .. } if n == "E:1"));
    }

    #[test]
    fn rerunning_against_unresolved_history_does_not_duplicate_the_schedule() {
        let decider = exec_once_decider();
        let mut state = WorkflowState::new("wf".into(), "d".into(), json!({}), 0);

        let commands = decide(&decider, &state, 0);
        crate::engine::apply_commands(&mut state, commands, 0).unwrap();

        let commands_again = decide(&decider, &state, 0);
        assert!(commands_again
            .iter()
            .all(|c| !matches!(c, Command::Exec { .. })));
    }

    #[test]
    fn completing_the_activity_lets_the_decider_finish() {
        let decider = exec_once_decider();
        let mut state = WorkflowState::new("wf".into(), "d".into(), json!({}), 0);

        let commands = decide(&decider, &state, 0);
        crate::engine::apply_commands(&mut state, commands, 0).unwrap();

        let task_id = state
            .tasks
            .keys()
            .next()
            .expect("exec task was scheduled")
            .clone();
        state.push_event(
            0,
            crate::model::EventData::ActivityCompleted {
                task_id,
                result: Value::Null,
            },
        );

        let commands = decide(&decider, &state, 0);
        crate::engine::apply_commands(&mut state, commands, 0).unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
    }
}
