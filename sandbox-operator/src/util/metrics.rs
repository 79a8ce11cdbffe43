use prometheus::{HistogramVec, IntCounterVec, Opts, Registry, register_histogram_vec_with_registry, register_int_counter_vec_with_registry};

/// Per-controller instrumentation, registered under a `{controller}_`
/// metric-name prefix against the process-wide default registry, so the
/// `sandbox`, `bypass` and `gc` controllers can all be gathered through one
/// registry without name collisions.
pub struct ControllerMetrics {
    pub registry: Registry,
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let registry = prometheus::default_registry().clone();
        let reconcile_counter = register_int_counter_vec_with_registry!(
            Opts::new(
                format!("{controller}_reconcile_total"),
                "Total number of reconciliations"
            ),
            &["name", "namespace"],
            registry
        )
        .expect("register reconcile_counter");
        let action_counter = register_int_counter_vec_with_registry!(
            Opts::new(
                format!("{controller}_action_total"),
                "Total number of actions taken, by kind"
            ),
            &["name", "namespace", "action"],
            registry
        )
        .expect("register action_counter");
        let read_histogram = register_histogram_vec_with_registry!(
            format!("{controller}_read_seconds"),
            "Time spent determining the next action",
            &["name", "namespace", "action"],
            registry
        )
        .expect("register read_histogram");
        let write_histogram = register_histogram_vec_with_registry!(
            format!("{controller}_write_seconds"),
            "Time spent applying the next action",
            &["name", "namespace", "action"],
            registry
        )
        .expect("register write_histogram");
        ControllerMetrics {
            registry,
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}
