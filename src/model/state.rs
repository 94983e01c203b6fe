use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorEnvelope;
use crate::model::event::Event;
use crate::time::TsMillis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Invariant 6 (§3): terminal workflows do not schedule new tasks.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Leased,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A single lease on an `exec` task (§3). `token` equals `fence` at the moment the lease was
/// issued and is the only thing a completion call is checked against (invariant 3, §8 law 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub token: u64,
    #[serde(with = "crate::time::ts_format")]
    pub expires_at: TsMillis,
    /// When this lease generation was issued; used to compute the activity-duration metric at
    /// completion time rather than reporting a constant.
    #[serde(with = "crate::time::ts_format")]
    pub started_at: TsMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Sleep {
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Exec {
        code: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        idem_key: Option<String>,
        #[serde(default)]
        tries: u32,
        #[serde(default = "default_max_tries")]
        max_tries: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        retry_delays: Vec<u64>,
        #[serde(default)]
        fence: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        lease: Option<Lease>,
    },
}

pub fn default_max_tries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(with = "crate::time::ts_format")]
    pub run_after: TsMillis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

impl Task {
    pub fn new_sleep(id: String, run_after: TsMillis, label: Option<String>) -> Self {
        Self {
            id,
            kind: TaskKind::Sleep { label },
            status: TaskStatus::Pending,
            run_after,
            result: None,
            error: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_exec(
        id: String,
        code: Value,
        name: Option<String>,
        run_after: TsMillis,
        idem_key: Option<String>,
        max_tries: u32,
        retry_delays: Vec<u64>,
    ) -> Self {
        Self {
            id,
            kind: TaskKind::Exec {
                code,
                name,
                idem_key,
                tries: 0,
                max_tries,
                retry_delays,
                fence: 0,
                lease: None,
            },
            status: TaskStatus::Pending,
            run_after,
            result: None,
            error: None,
        }
    }

    pub fn is_sleep(&self) -> bool {
        matches!(self.kind, TaskKind::Sleep { .. })
    }

    pub fn is_exec(&self) -> bool {
        matches!(self.kind, TaskKind::Exec { .. })
    }

    pub fn lease(&self) -> Option<&Lease> {
        match &self.kind {
            TaskKind::Exec { lease, .. } => lease.as_ref(),
            TaskKind::Sleep { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    #[serde(with = "crate::time::ts_format")]
    pub ts: TsMillis,
    pub name: String,
    pub payload: Value,
}

/// The single persisted blob per workflow (§3). Mirrors `gasoline`'s `WorkflowCtx`/`PulledWorkflowData`
/// state, collapsed from FoundationDB's decomposed key space into one JSON document since this
/// crate's store is a single-blob CAS abstraction rather than a transactional key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    #[serde(default)]
    pub rev: u64,
    pub status: WorkflowStatus,
    #[serde(with = "crate::time::ts_format")]
    pub created_at: TsMillis,
    #[serde(with = "crate::time::ts_format")]
    pub updated_at: TsMillis,
    pub ctx: Value,
    pub history: Vec<Event>,
    pub tasks: BTreeMap<String, Task>,
    pub need_decide: bool,
    #[serde(default, with = "crate::time::opt_ts_format")]
    pub next_wake: Option<TsMillis>,
    pub seq: u64,
    pub decider: String,
    pub signals: Vec<SignalRecord>,
}

impl WorkflowState {
    pub fn new(id: String, decider: String, initial_ctx: Value, now: TsMillis) -> Self {
        Self {
            id,
            rev: 0,
            status: WorkflowStatus::Running,
            created_at: now,
            updated_at: now,
            ctx: initial_ctx,
            history: Vec::new(),
            tasks: BTreeMap::new(),
            need_decide: true,
            next_wake: None,
            seq: 0,
            decider,
            signals: Vec::new(),
        }
    }

    /// Mints the next deterministic task id (`t000001`, `t000002`, ...). Invariant 4 (§3): `seq`
    /// is strictly increasing within a workflow and ids are unique and lexicographically ordered
    /// by creation.
    pub fn next_task_id(&mut self) -> String {
        self.seq += 1;
        format!("t{:06}", self.seq)
    }

    pub fn push_event(&mut self, ts: TsMillis, data: crate::model::event::EventData) {
        self.history.push(Event::new(ts, data));
    }
}

/// Applies a dot-path write to a JSON object, creating intermediate objects as needed (§9 "Dot-path
/// setter"). Numeric path segments are treated as string object keys, never array indices.
pub fn set_dot_path(root: &mut Value, path: &str, value: Value) {
    if !root.is_object() {
        *root = Value::Object(Default::default());
    }

    let mut segments = path.split('.').peekable();
    let mut cursor = root;

    while let Some(segment) = segments.next() {
        let obj = cursor
            .as_object_mut()
            .expect("cursor is always coerced to an object before indexing");

        if segments.peek().is_none() {
            obj.insert(segment.to_string(), value);
            return;
        }

        let entry = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = Value::Object(Default::default());
        }
        cursor = entry;
    }
}

/// Reads a dot-path; returns `None` if any intermediate segment is missing or not an object.
pub fn get_dot_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = root;
    for segment in path.split('.') {
        cursor = cursor.as_object()?.get(segment)?;
    }
    Some(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dot_path_creates_intermediate_objects() {
        let mut v = json!({});
        set_dot_path(&mut v, "a.b.c", json!(1));
        assert_eq!(v, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn dot_path_overwrites_leaf() {
        let mut v = json!({"a": {"b": 1}});
        set_dot_path(&mut v, "a.b", json!(2));
        assert_eq!(v, json!({"a": {"b": 2}}));
    }

    #[test]
    fn dot_path_numeric_segment_is_a_string_key() {
        let mut v = json!({});
        set_dot_path(&mut v, "a.0", json!("x"));
        assert_eq!(v, json!({"a": {"0": "x"}}));
    }

    #[test]
    fn next_task_id_is_monotonic_and_zero_padded() {
        let mut s = WorkflowState::new("wf".into(), "dec".into(), json!({}), 0);
        assert_eq!(s.next_task_id(), "t000001");
        assert_eq!(s.next_task_id(), "t000002");
    }
}
