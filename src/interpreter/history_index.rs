use std::collections::HashMap;

use serde_json::Value;

use crate::model::{EventData, SignalRecord, WorkflowState};

/// A one-pass summary of a workflow's `history` (and `signals`), built once per decider
/// invocation and consulted by every effect resolution (§4.4 "History correlation"). Scanning
/// once keeps replay `O(history)` instead of `O(history * effects)`.
pub struct HistoryIndex {
    exec_scheduled_by_id: HashMap<String, String>,
    exec_completed_by_task: HashMap<String, Value>,
    timer_scheduled_by_id: HashMap<String, String>,
    timer_fired: std::collections::HashSet<String>,
    signals_by_name: HashMap<String, Vec<SignalRecord>>,
    /// Task ids in the order their completion/firing event appears in `history` — the
    /// tie-break order for `race` (§4.4 step 2, §5 "Race tie-break").
    completion_order: Vec<String>,
}

impl HistoryIndex {
    pub fn build(state: &WorkflowState) -> Self {
        let mut exec_scheduled_by_id = HashMap::new();
        let mut exec_completed_by_task = HashMap::new();
        let mut timer_scheduled_by_id = HashMap::new();
        let mut timer_fired = std::collections::HashSet::new();
        let mut completion_order = Vec::new();

        for event in &state.history {
            match &event.data {
                EventData::ActivityScheduled {
                    task_id,
                    name: Some(name),
                } => {
                    if let Some(eid) = name.strip_prefix("E:") {
                        exec_scheduled_by_id.insert(eid.to_string(), task_id.clone());
                    }
                }
                EventData::TimerScheduled {
                    task_id,
                    label: Some(label),
                    ..
                } => {
                    if let Some(eid) = label.strip_prefix("S:") {
                        timer_scheduled_by_id.insert(eid.to_string(), task_id.clone());
                    }
                }
                EventData::ActivityCompleted { task_id, result } => {
                    exec_completed_by_task.insert(task_id.clone(), result.clone());
                    completion_order.push(task_id.clone());
                }
                EventData::TimerFired { task_id } => {
                    timer_fired.insert(task_id.clone());
                    completion_order.push(task_id.clone());
                }
                _ => {}
            }
        }

        let mut signals_by_name: HashMap<String, Vec<SignalRecord>> = HashMap::new();
        for signal in &state.signals {
            signals_by_name
                .entry(signal.name.clone())
                .or_default()
                .push(signal.clone());
        }

        Self {
            exec_scheduled_by_id,
            exec_completed_by_task,
            timer_scheduled_by_id,
            timer_fired,
            signals_by_name,
            completion_order,
        }
    }

    pub fn exec_task_for(&self, eid: &str) -> Option<&str> {
        self.exec_scheduled_by_id.get(eid).map(String::as_str)
    }

    pub fn exec_result(&self, task_id: &str) -> Option<&Value> {
        self.exec_completed_by_task.get(task_id)
    }

    pub fn timer_task_for(&self, eid: &str) -> Option<&str> {
        self.timer_scheduled_by_id.get(eid).map(String::as_str)
    }

    pub fn timer_fired(&self, task_id: &str) -> bool {
        self.timer_fired.contains(task_id)
    }

    pub fn signal_at(&self, name: &str, index: usize) -> Option<&SignalRecord> {
        self.signals_by_name.get(name).and_then(|v| v.get(index))
    }

    /// Index into `completion_order` of the earliest-completed task among candidates, used by
    /// `race` step 2.
    pub fn earliest_completed<'a>(&self, task_ids: &[(&'a str, &'a str)]) -> Option<&'a str> {
        let mut best: Option<(usize, &'a str)> = None;

        for (key, task_id) in task_ids {
            if let Some(pos) = self.completion_order.iter().position(|t| t == task_id) {
                if best.is_none() || pos < best.unwrap().0 {
                    best = Some((pos, key));
                }
            }
        }

        best.map(|(_, key)| key)
    }
}
