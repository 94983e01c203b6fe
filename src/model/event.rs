use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorEnvelope;
use crate::time::TsMillis;

/// One entry in a workflow's append-only `history` (§3). `ts` is common to every variant; the
/// rest is carried in `data`. Events are never rewritten or reordered once appended (invariant
/// 3, §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "crate::time::ts_format")]
    pub ts: TsMillis,
    #[serde(flatten)]
    pub data: EventData,
}

impl Event {
    pub fn new(ts: TsMillis, data: EventData) -> Self {
        Self { ts, data }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    WfCreated {
        decider: String,
    },
    WfCompleted,
    WfFailed {
        reason: ErrorEnvelope,
    },
    TimerScheduled {
        task_id: String,
        #[serde(with = "crate::time::ts_format")]
        run_after: TsMillis,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    TimerFired {
        task_id: String,
    },
    ActivityScheduled {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ActivityCompleted {
        task_id: String,
        result: Value,
    },
    ActivityFailed {
        task_id: String,
        error: ErrorEnvelope,
    },
    ActivityRetry {
        task_id: String,
        after_seconds: u64,
        error: ErrorEnvelope,
    },
    CtxSet {
        key: String,
    },
    Signal {
        name: String,
        payload: Value,
    },
}

impl EventData {
    /// Used by the interpreter's `race` resolution (§4.4) to order completion events.
    pub fn completed_task_id(&self) -> Option<&str> {
        match self {
            EventData::TimerFired { task_id } => Some(task_id),
            EventData::ActivityCompleted { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
