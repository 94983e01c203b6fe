//! Counters/histograms emitted via the `metrics` facade. Stands in for `gasoline`'s
//! `rivet-metrics`/`opentelemetry` wiring (dropped — see DESIGN.md) while keeping the same
//! instrumentation points: one counter per tick, per activity outcome, per workflow terminal
//! status.

use metrics::{counter, histogram};

pub fn record_tick(decider: &str) {
    counter!("flowkeep_workflow_ticks_total", "decider" => decider.to_string()).increment(1);
}

pub fn record_activity_duration(decider: &str, activity: &str, outcome: &str, dt_secs: f64) {
    histogram!(
        "flowkeep_activity_duration_seconds",
        "decider" => decider.to_string(),
        "activity" => activity.to_string(),
        "outcome" => outcome.to_string(),
    )
    .record(dt_secs);
}

pub fn record_activity_error(decider: &str, activity: &str) {
    counter!(
        "flowkeep_activity_errors_total",
        "decider" => decider.to_string(),
        "activity" => activity.to_string(),
    )
    .increment(1);
}

pub fn record_workflow_terminal(decider: &str, status: &str) {
    counter!(
        "flowkeep_workflow_terminal_total",
        "decider" => decider.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}
