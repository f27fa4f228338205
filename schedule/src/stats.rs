//! Counters and timers accumulated across a search.

use std::time::Duration;

/// Statistics for one search run. Logged at the end of the run and returned
/// to the caller alongside the best state.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub num_states_added: u64,
    pub num_featurizations: u64,
    pub num_memoization_hits: u64,
    pub num_memoization_misses: u64,
    pub num_schedules_enqueued: u64,

    pub generate_children_time: Duration,
    pub featurization_time: Duration,
    pub enqueue_time: Duration,
    pub cost_model_evaluation_time: Duration,
}

impl Statistics {
    pub fn total_generate_children_time_ms(&self) -> f64 {
        self.generate_children_time.as_secs_f64() * 1e3
    }

    pub fn total_featurization_time_ms(&self) -> f64 {
        self.featurization_time.as_secs_f64() * 1e3
    }

    pub fn average_featurization_time_ms(&self) -> f64 {
        if self.num_featurizations == 0 {
            return 0.0;
        }
        self.total_featurization_time_ms() / self.num_featurizations as f64
    }

    pub fn total_enqueue_time_ms(&self) -> f64 {
        self.enqueue_time.as_secs_f64() * 1e3
    }

    pub fn total_cost_model_evaluation_time_ms(&self) -> f64 {
        self.cost_model_evaluation_time.as_secs_f64() * 1e3
    }

    pub fn average_cost_model_evaluation_time_ms(&self) -> f64 {
        if self.num_schedules_enqueued == 0 {
            return 0.0;
        }
        self.total_cost_model_evaluation_time_ms() / self.num_schedules_enqueued as f64
    }

    /// Emit the end-of-run summary through the structured log.
    pub fn log_summary(&self) {
        tracing::info!(
            states_added = self.num_states_added,
            featurizations = self.num_featurizations,
            memoization_hits = self.num_memoization_hits,
            memoization_misses = self.num_memoization_misses,
            schedules_enqueued = self.num_schedules_enqueued,
            "search statistics"
        );
        tracing::info!(
            generate_children_ms = self.total_generate_children_time_ms(),
            featurization_ms = self.total_featurization_time_ms(),
            enqueue_ms = self.total_enqueue_time_ms(),
            cost_model_evaluation_ms = self.total_cost_model_evaluation_time_ms(),
            "search phase times"
        );
    }
}
