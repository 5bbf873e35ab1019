use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::{
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts admission reviews by how they were answered.
#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    reviews: Family<OutcomeLabels, Counter>,
    patch_operations: Counter,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Allowed with a non-empty patch.
    Patched,
    /// Allowed without changes although the pod was eligible.
    Unchanged,
    /// Not an application pod.
    Ineligible,
    /// Denied.
    Rejected,
    /// Not a pod review at all.
    Invalid,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OutcomeLabels {
    outcome: &'static str,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reviews = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "reviews",
            "Total number of pod admission reviews handled, by outcome",
            reviews.clone(),
        );

        let patch_operations = Counter::default();
        reg.register(
            "patch_operations",
            "Total number of JSON patch operations returned to the API server",
            patch_operations.clone(),
        );

        Self {
            reviews,
            patch_operations,
        }
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        self.reviews
            .get_or_create(&OutcomeLabels {
                outcome: outcome.as_str(),
            })
            .inc();
    }

    pub(crate) fn patched(&self, ops: usize) {
        self.record(Outcome::Patched);
        self.patch_operations.inc_by(ops as u64);
    }
}

// === impl Outcome ===

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Patched => "patched",
            Self::Unchanged => "unchanged",
            Self::Ineligible => "ineligible",
            Self::Rejected => "rejected",
            Self::Invalid => "invalid",
        }
    }
}
