use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::{Registry, Unit};

/// Metrics for the metadata cache and the label injector.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Number of prefixes tracked in the metadata map.
    pub(crate) prefixes: Gauge,

    /// Number of distinct identities referenced by cached entries.
    pub(crate) identities: Gauge,

    /// Number of prefixes queued for label injection.
    pub(crate) queue_depth: Gauge,

    /// Wall-clock duration of injection ticks, in seconds.
    pub(crate) injection_duration: Histogram,

    /// Failed injection ticks.
    pub(crate) injection_errors: Counter,
}

impl Metrics {
    /// Builds the metric set and registers it under the `ipcache` prefix.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_prefix("ipcache");

        registry.register(
            "prefixes_total",
            "Number of prefixes tracked in the metadata map",
            metrics.prefixes.clone(),
        );
        registry.register(
            "identities_total",
            "Number of distinct identities referenced by cached entries",
            metrics.identities.clone(),
        );
        registry.register(
            "queue_depth",
            "Number of prefixes queued for label injection",
            metrics.queue_depth.clone(),
        );
        registry.register_with_unit(
            "injection_duration",
            "Duration of label injection ticks",
            Unit::Seconds,
            metrics.injection_duration.clone(),
        );
        registry.register(
            "injection_errors",
            "Count of failed label injection ticks",
            metrics.injection_errors.clone(),
        );

        metrics
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            prefixes: Gauge::default(),
            identities: Gauge::default(),
            queue_depth: Gauge::default(),
            injection_duration: Histogram::new(exponential_buckets(0.001, 2.0, 12)),
            injection_errors: Counter::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_does_not_panic_and_metrics_record() {
        let mut registry = Registry::default();
        let metrics = Metrics::register(&mut registry);
        metrics.prefixes.set(3);
        metrics.injection_errors.inc();
        metrics.injection_duration.observe(0.25);
        assert_eq!(metrics.prefixes.get(), 3);
        assert_eq!(metrics.injection_errors.get(), 1);
    }
}
