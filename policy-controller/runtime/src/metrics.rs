use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct EngineMetrics {
    retry_queue_depth: Gauge,
    reconciles: Family<ReconcileLabels, Counter>,
    transact_failures: Family<FailureLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    kind: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    class: &'static str,
}

/// How a reconcile attempt ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Committed,
    Failed,
    /// Nothing had to be written.
    Skipped,
}

// === impl EngineMetrics ===

impl EngineMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let retry_queue_depth = Gauge::default();
        reg.register(
            "retry_queue_depth",
            "The number of keys waiting to be retried",
            retry_queue_depth.clone(),
        );

        let reconciles = Family::default();
        reg.register(
            "reconciles",
            "Count of reconcile attempts by key kind and result",
            reconciles.clone(),
        );

        let transact_failures = Family::default();
        reg.register(
            "transact_failures",
            "Count of failed backend transactions by error class",
            transact_failures.clone(),
        );

        Self {
            retry_queue_depth,
            reconciles,
            transact_failures,
        }
    }

    pub(crate) fn set_retry_depth(&self, depth: usize) {
        self.retry_queue_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub(crate) fn reconciled(&self, kind: &'static str, outcome: Outcome) {
        let result = match outcome {
            Outcome::Committed => "committed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        };
        self.reconciles
            .get_or_create(&ReconcileLabels { kind, result })
            .inc();
    }

    pub(crate) fn transact_failed(&self, transient: bool) {
        let class = if transient { "transient" } else { "fatal" };
        self.transact_failures
            .get_or_create(&FailureLabels { class })
            .inc();
    }
}
