use serde_json::Value;

use crate::time::TsMillis;

/// Per-call overrides for an `exec` effect (§4.4 effect table). Any field left `None` falls back
/// to the workflow's own defaults, then the engine's built-in defaults (`apply_commands`, §4.3.6).
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub max_tries: Option<u32>,
    pub retry_delays: Option<Vec<u64>>,
    pub idem_key: Option<String>,
    pub run_after: Option<TsMillis>,
}

/// A description of an effect that has not yet been resolved against history. Top-level effect
/// methods on `Io` build one of these and immediately resolve it; `all`/`race` resolve a whole
/// vec of them together so every child gets a chance to schedule in the same tick.
#[derive(Debug, Clone)]
pub enum EffectDesc {
    Exec {
        action: String,
        input: Value,
        opts: ExecOpts,
    },
    Sleep {
        seconds: u64,
    },
    Until {
        ts: TsMillis,
    },
    Signal {
        name: String,
    },
}

impl EffectDesc {
    pub fn exec(action: impl Into<String>, input: Value, opts: ExecOpts) -> Self {
        EffectDesc::Exec {
            action: action.into(),
            input,
            opts,
        }
    }

    pub fn sleep(seconds: u64) -> Self {
        EffectDesc::Sleep { seconds }
    }

    pub fn until(ts: TsMillis) -> Self {
        EffectDesc::Until { ts }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        EffectDesc::Signal { name: name.into() }
    }
}
