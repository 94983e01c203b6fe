use std::collections::HashMap;
use std::convert::Infallible;

use serde_json::{json, Value};

use super::effect::{EffectDesc, ExecOpts};
use super::history_index::HistoryIndex;
use crate::model::{set_dot_path, Command};
use crate::time::TsMillis;

/// Propagated via `?` from every `Io` effect method when the workflow body must stop running
/// this tick — either because an effect is still pending, or because `complete`/`fail` was
/// called and there is nothing left to run (§4.4 "Replay algorithm"). Carries no data: the
/// commands staged so far on `Io` are the entire observable result of a suspended tick.
#[derive(Debug, Clone, Copy)]
pub struct Suspend;

/// The handle a workflow body function receives. Each method corresponds to one row of the
/// effect table in §4.4: it either resolves immediately from history (returning `Ok`) or stages
/// a command and bails with `Suspend`, exactly where the distilled generator DSL would `yield`.
pub struct Io<'a> {
    history: &'a HistoryIndex,
    ctx_mirror: Value,
    now: TsMillis,
    cursor: u64,
    sig_consumed: HashMap<String, u64>,
    staged_sets: Vec<Command>,
    staged_other: Vec<Command>,
}

impl<'a> Io<'a> {
    /// `sig_consumed` always starts empty, never seeded from the persisted `$wf.sigCount` — it
    /// counts how many times *this* replay walk has resolved each signal name, not how many a
    /// prior tick consumed. A replay that re-executes the same call sequence re-derives the same
    /// counts from `history`/`signals` on its own; seeding from ctx would double-count a signal
    /// already consumed in an earlier tick and stall the workflow on the very effect that already
    /// resolved (see DESIGN.md).
    pub fn new(history: &'a HistoryIndex, ctx_snapshot: Value, now: TsMillis) -> Self {
        Self {
            history,
            ctx_mirror: ctx_snapshot,
            now,
            cursor: 0,
            sig_consumed: HashMap::new(),
            staged_sets: Vec::new(),
            staged_other: Vec::new(),
        }
    }

    pub fn ctx(&self) -> &Value {
        &self.ctx_mirror
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        crate::model::get_dot_path(&self.ctx_mirror, path)
    }

    pub fn now(&self) -> TsMillis {
        self.now
    }

    fn next_id(&mut self) -> String {
        self.cursor += 1;
        self.cursor.to_string()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Splits staged commands into (sets, others) so a caller can interleave its own bookkeeping
    /// sets (e.g. the `$wf.cursor` update) while still keeping every set ahead of every other
    /// command in the final emitted order.
    pub fn into_parts(self) -> (Vec<Command>, Vec<Command>) {
        (self.staged_sets, self.staged_other)
    }

    pub fn exec(&mut self, action: impl Into<String>, input: Value, opts: ExecOpts) -> Result<Value, Suspend> {
        let id = self.next_id();
        let desc = EffectDesc::exec(action, input, opts);
        self.resolve(&id, &desc).ok_or(Suspend)
    }

    pub fn sleep(&mut self, seconds: u64) -> Result<(), Suspend> {
        let id = self.next_id();
        let desc = EffectDesc::sleep(seconds);
        self.resolve(&id, &desc).map(|_| ()).ok_or(Suspend)
    }

    pub fn until(&mut self, ts: TsMillis) -> Result<(), Suspend> {
        let id = self.next_id();
        let desc = EffectDesc::until(ts);
        self.resolve(&id, &desc).map(|_| ()).ok_or(Suspend)
    }

    pub fn signal(&mut self, name: impl Into<String>) -> Result<Value, Suspend> {
        let id = self.next_id();
        let desc = EffectDesc::signal(name);
        self.resolve(&id, &desc).ok_or(Suspend)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<(), Suspend> {
        let _ = self.next_id();
        let key = key.into();
        set_dot_path(&mut self.ctx_mirror, &key, value.clone());
        self.staged_sets.push(Command::Set { key, value });
        Ok(())
    }

    pub fn complete(&mut self, value: Option<Value>) -> Result<Infallible, Suspend> {
        let _ = self.next_id();
        if let Some(value) = value {
            self.set("result", value).ok();
        }
        self.staged_other.push(Command::CompleteWorkflow);
        Err(Suspend)
    }

    pub fn fail(&mut self, reason: Option<String>) -> Result<Infallible, Suspend> {
        let _ = self.next_id();
        self.staged_other.push(Command::FailWorkflow { reason });
        Err(Suspend)
    }

    pub fn all(&mut self, descs: Vec<EffectDesc>) -> Result<Vec<Value>, Suspend> {
        let parent_id = self.next_id();
        let mut results = Vec::with_capacity(descs.len());
        let mut all_done = true;

        for (i, desc) in descs.iter().enumerate() {
            let child_id = format!("{parent_id}.{i}");
            match self.resolve(&child_id, desc) {
                Some(v) => results.push(v),
                None => all_done = false,
            }
        }

        if all_done {
            Ok(results)
        } else {
            Err(Suspend)
        }
    }

    /// `race` over a named map of child effects (§4.4 step "race"). Signal children are only
    /// *peeked*, never consumed, until a winner is chosen — otherwise probing a losing signal
    /// child would consume it even though a different child won.
    pub fn race(&mut self, children: Vec<(String, EffectDesc)>) -> Result<(String, Value), Suspend> {
        let parent_id = self.next_id();

        let mut signal_candidates: Vec<(&str, TsMillis, Value)> = Vec::new();
        let mut completed_candidates: Vec<(&str, &str)> = Vec::new();
        let mut completed_values: HashMap<String, Value> = HashMap::new();

        for (key, desc) in &children {
            let child_id = format!("{parent_id}.{key}");
            match desc {
                EffectDesc::Signal { name } => {
                    let consumed = *self.sig_consumed.get(name).unwrap_or(&0) as usize;
                    if let Some(record) = self.history.signal_at(name, consumed) {
                        signal_candidates.push((key.as_str(), record.ts, record.payload.clone()));
                    }
                }
                EffectDesc::Exec { .. } => {
                    if let Some(task_id) = self.history.exec_task_for(&child_id) {
                        if let Some(result) = self.history.exec_result(task_id) {
                            completed_values.insert(key.clone(), result.clone());
                            completed_candidates.push((key.as_str(), task_id));
                        }
                    } else {
                        self.stage_schedule(&child_id, desc);
                    }
                }
                EffectDesc::Sleep { .. } | EffectDesc::Until { .. } => {
                    if let Some(task_id) = self.history.timer_task_for(&child_id) {
                        if self.history.timer_fired(task_id) {
                            completed_values.insert(key.clone(), Value::Null);
                            completed_candidates.push((key.as_str(), task_id));
                        }
                    } else {
                        self.stage_schedule(&child_id, desc);
                    }
                }
            }
        }

        if let Some((winner, ts, payload)) = signal_candidates
            .into_iter()
            .min_by_key(|(_, ts, _)| *ts)
        {
            let _ = ts;
            let name = children
                .iter()
                .find(|(k, _)| k.as_str() == winner)
                .and_then(|(_, d)| match d {
                    EffectDesc::Signal { name } => Some(name.clone()),
                    _ => None,
                })
                .expect("winner came from a signal candidate");
            let consumed = *self.sig_consumed.get(&name).unwrap_or(&0);
            self.sig_consumed.insert(name.clone(), consumed + 1);
            self.staged_sets.push(Command::Set {
                key: format!("$wf.sigCount.{name}"),
                value: json!(consumed + 1),
            });
            return Ok((winner.to_string(), payload));
        }

        if let Some(winner) = self.history.earliest_completed(&completed_candidates) {
            let value = completed_values.remove(winner).unwrap_or(Value::Null);
            return Ok((winner.to_string(), value));
        }

        Err(Suspend)
    }

    fn resolve(&mut self, id: &str, desc: &EffectDesc) -> Option<Value> {
        match desc {
            EffectDesc::Signal { name } => {
                let consumed = *self.sig_consumed.get(name).unwrap_or(&0) as usize;
                let record = self.history.signal_at(name, consumed)?;
                let payload = record.payload.clone();
                let next = consumed as u64 + 1;
                self.sig_consumed.insert(name.clone(), next);
                self.staged_sets.push(Command::Set {
                    key: format!("$wf.sigCount.{name}"),
                    value: json!(next),
                });
                Some(payload)
            }
            EffectDesc::Exec { .. } => {
                if let Some(task_id) = self.history.exec_task_for(id) {
                    self.history.exec_result(task_id).cloned()
                } else {
                    self.stage_schedule(id, desc);
                    None
                }
            }
            EffectDesc::Sleep { .. } | EffectDesc::Until { .. } => {
                if let Some(task_id) = self.history.timer_task_for(id) {
                    if self.history.timer_fired(task_id) {
                        Some(Value::Null)
                    } else {
                        None
                    }
                } else {
                    self.stage_schedule(id, desc);
                    None
                }
            }
        }
    }

    fn stage_schedule(&mut self, id: &str, desc: &EffectDesc) {
        match desc {
            EffectDesc::Exec { action, input, opts } => {
                let code = json!({ "action": action, "input": input });
                self.staged_other.push(Command::Exec {
                    name: Some(format!("E:{id}")),
                    code,
                    run_after: opts.run_after,
                    idem_key: opts.idem_key.clone(),
                    max_tries: opts.max_tries,
                    retry_delays: opts.retry_delays.clone(),
                });
            }
            EffectDesc::Sleep { seconds } => {
                self.staged_other.push(Command::Sleep {
                    seconds: Some(*seconds),
                    until: None,
                    label: Some(format!("S:{id}")),
                });
            }
            EffectDesc::Until { ts } => {
                self.staged_other.push(Command::Sleep {
                    seconds: None,
                    until: Some(*ts),
                    label: Some(format!("S:{id}")),
                });
            }
            EffectDesc::Signal { .. } => {}
        }
    }
}
