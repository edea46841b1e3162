use crate::core::ResponseClass;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResponseLabels {
    admission_status: String,
}

/// Webhook request instrumentation: a latency histogram per response class
/// and a gauge of requests parked on the serving semaphore.
#[derive(Clone)]
pub(crate) struct AdmissionMetrics {
    requests: Family<ResponseLabels, Histogram>,
    pending: Gauge,
}

impl AdmissionMetrics {
    pub(crate) fn register(registry: &mut Registry) -> Self {
        let requests = Family::<ResponseLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0].into_iter())
        });
        registry.register_with_unit(
            "validation_request_duration",
            "The time spent handling an admission review, by response class",
            Unit::Seconds,
            requests.clone(),
        );

        let pending = Gauge::default();
        registry.register(
            "pending_validation_requests",
            "The number of admission reviews waiting for a serving slot",
            pending.clone(),
        );

        Self { requests, pending }
    }

    /// A sink for tests that do not scrape a registry.
    #[cfg(test)]
    pub(crate) fn unregistered() -> Self {
        Self {
            requests: Family::new_with_constructor(|| Histogram::new([1.0].into_iter())),
            pending: Gauge::default(),
        }
    }

    pub(crate) fn observe(&self, class: ResponseClass, elapsed: Duration) {
        self.requests
            .get_or_create(&ResponseLabels {
                admission_status: class.as_str().to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    /// Marks a request as parked until the returned guard drops.
    pub(crate) fn pending(&self) -> PendingGuard {
        self.pending.inc();
        PendingGuard(self.pending.clone())
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> i64 {
        self.pending.get()
    }
}

pub(crate) struct PendingGuard(Gauge);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_guard_tracks_parked_requests() {
        let metrics = AdmissionMetrics::unregistered();
        assert_eq!(metrics.pending_count(), 0);

        let a = metrics.pending();
        let b = metrics.pending();
        assert_eq!(metrics.pending_count(), 2);

        drop(a);
        assert_eq!(metrics.pending_count(), 1);
        drop(b);
        assert_eq!(metrics.pending_count(), 0);
    }
}
