use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{
        gauge::{ConstGauge, Gauge},
        histogram::Histogram,
        MetricType,
    },
    registry::{Registry, Unit},
};
use std::{
    sync::{atomic::AtomicU64, Arc},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Active,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Active => "active",
            SyncStatus::Error => "error",
        }
    }

    const ALL: [SyncStatus; 2] = [SyncStatus::Active, SyncStatus::Error];
}

pub type SharedMetricsCache = Arc<MetricsCache>;

/// Tracks every object mirrored into the engine's data space, keyed by
/// `namespace/name`, for per-kind gauge exposition.
///
/// Kinds are remembered after their last object disappears so their series
/// report zero instead of vanishing.
#[derive(Default)]
pub struct MetricsCache {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Tags>,
    known_kinds: HashSet<String>,
}

struct Tags {
    kind: String,
    status: SyncStatus,
}

impl MetricsCache {
    pub fn shared() -> SharedMetricsCache {
        Arc::new(Self::default())
    }

    pub fn upsert(&self, key: &str, kind: &str, status: SyncStatus) {
        let mut inner = self.inner.write();
        inner.known_kinds.insert(kind.to_string());
        inner.objects.insert(
            key.to_string(),
            Tags {
                kind: kind.to_string(),
                status,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.inner.write().objects.remove(key);
    }

    fn count(&self, kind: &str, status: SyncStatus) -> u32 {
        self.inner
            .read()
            .objects
            .values()
            .filter(|t| t.kind == kind && t.status == status)
            .count() as u32
    }
}

#[derive(Debug)]
struct SyncCollector(SharedMetricsCache);

impl Collector for SyncCollector {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let mut sync_encoder = encoder.encode_descriptor(
            "sync",
            "The number of objects mirrored into the data cache, by kind and status",
            None,
            MetricType::Gauge,
        )?;

        let kinds = {
            let inner = self.0.inner.read();
            let mut kinds = inner.known_kinds.iter().cloned().collect::<Vec<_>>();
            kinds.sort();
            kinds
        };
        for kind in &kinds {
            for status in SyncStatus::ALL {
                let labels = vec![("kind", kind.as_str()), ("status", status.as_str())];
                let count = ConstGauge::new(self.0.count(kind, status));
                let label_encoder = sync_encoder.encode_family(&labels)?;
                count.encode(label_encoder)?;
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for MetricsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCache").finish_non_exhaustive()
    }
}

/// Per-reconcile sync instrumentation.
#[derive(Clone)]
pub struct SyncMetrics {
    duration: Histogram,
    last_run: Gauge<f64, AtomicU64>,
}

impl SyncMetrics {
    pub fn register(registry: &mut Registry, cache: SharedMetricsCache) -> Self {
        let duration = Histogram::new([0.0001, 0.001, 0.01, 0.1, 1.0, 10.0].into_iter());
        registry.register_with_unit(
            "sync_duration",
            "The time spent mirroring an object into the data cache",
            Unit::Seconds,
            duration.clone(),
        );

        let last_run = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "sync_last_run_time",
            "Unix timestamp of the most recent sync reconcile",
            last_run.clone(),
        );

        registry.register_collector(Box::new(SyncCollector(cache)));

        Self { duration, last_run }
    }

    /// A no-op sink for tests that do not assert on metrics.
    pub fn unregistered() -> Self {
        Self {
            duration: Histogram::new([1.0].into_iter()),
            last_run: Gauge::default(),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        self.duration.observe(elapsed.as_secs_f64());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.last_run.set(now.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_objects_by_kind_and_status() {
        let cache = MetricsCache::default();
        cache.upsert("ns1/a", "Pod", SyncStatus::Active);
        cache.upsert("ns1/b", "Pod", SyncStatus::Active);
        cache.upsert("ns2/c", "Pod", SyncStatus::Error);
        cache.upsert("ns1/d", "Service", SyncStatus::Active);

        assert_eq!(cache.count("Pod", SyncStatus::Active), 2);
        assert_eq!(cache.count("Pod", SyncStatus::Error), 1);
        assert_eq!(cache.count("Service", SyncStatus::Active), 1);
        assert_eq!(cache.count("Service", SyncStatus::Error), 0);
    }

    #[test]
    fn upsert_replaces_prior_status() {
        let cache = MetricsCache::default();
        cache.upsert("ns1/a", "Pod", SyncStatus::Error);
        cache.upsert("ns1/a", "Pod", SyncStatus::Active);
        assert_eq!(cache.count("Pod", SyncStatus::Error), 0);
        assert_eq!(cache.count("Pod", SyncStatus::Active), 1);
    }

    #[test]
    fn kinds_remain_known_after_deletion() {
        let cache = MetricsCache::default();
        cache.upsert("ns1/a", "Pod", SyncStatus::Active);
        cache.delete("ns1/a");

        assert_eq!(cache.count("Pod", SyncStatus::Active), 0);
        assert!(cache.inner.read().known_kinds.contains("Pod"));
    }
}
