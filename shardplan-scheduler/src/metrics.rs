//! Scheduler metrics
//!
//! Counters for checker decisions, filter rejections and created operators.
//! Exporting is left to the embedding process.

use metrics::{counter, describe_counter};

/// Metric names as constants
pub mod names {
    pub const CHECKER_EVENTS: &str = "shardplan_checker_events_total";
    pub const FILTER_REJECTIONS: &str = "shardplan_filter_rejections_total";
    pub const OPERATORS_CREATED: &str = "shardplan_operators_created_total";
    pub const OPERATOR_STEPS_FINISHED: &str = "shardplan_operator_steps_finished_total";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(
        names::CHECKER_EVENTS,
        "Checker decisions by checker and event"
    );
    describe_counter!(
        names::FILTER_REJECTIONS,
        "Stores rejected by a filter, by scope, filter type and action"
    );
    describe_counter!(
        names::OPERATORS_CREATED,
        "Operators created, by description"
    );
    describe_counter!(
        names::OPERATOR_STEPS_FINISHED,
        "Operator steps observed as finished"
    );
}

/// Record a checker event
pub fn record_checker_event(checker: &'static str, event: &'static str) {
    counter!(names::CHECKER_EVENTS, "checker" => checker, "event" => event).increment(1);
}

/// Record a store rejected by a filter
pub fn record_filter_rejection(scope: &str, filter_type: &'static str, action: &'static str) {
    counter!(
        names::FILTER_REJECTIONS,
        "scope" => scope.to_string(),
        "type" => filter_type,
        "action" => action
    )
    .increment(1);
}

/// Record a created operator
pub fn record_operator_created(desc: &str) {
    counter!(names::OPERATORS_CREATED, "desc" => desc.to_string()).increment(1);
}

/// Record finished operator steps
pub fn record_steps_finished(count: u64) {
    if count > 0 {
        counter!(names::OPERATOR_STEPS_FINISHED).increment(count);
    }
}
