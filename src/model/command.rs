use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::TsMillis;

/// The output of a decider invocation (§4.3.6, §4.4 "Emitted command order"). Commands are
/// applied in the order they appear in the vec; the interpreter is responsible for staging all
/// `Set` commands first so context mutations are visible before any task is scheduled in the
/// same tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Command {
    Sleep {
        #[serde(skip_serializing_if = "Option::is_none")]
        seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::time::opt_ts_format")]
        until: Option<TsMillis>,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Exec {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        code: Value,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::time::opt_ts_format")]
        run_after: Option<TsMillis>,
        #[serde(skip_serializing_if = "Option::is_none")]
        idem_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_tries: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_delays: Option<Vec<u64>>,
    },
    Set {
        key: String,
        value: Value,
    },
    CompleteWorkflow,
    FailWorkflow {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}
