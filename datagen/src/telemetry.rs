//! Run-wide production counters.
//!
//! ## Metrics
//!
//! `generator_bytes_produced_total`: Total bytes produced
//! `generator_records_produced_total`: Total records produced
//! `generator_write_failures_total`: Payload or audit writes that failed
//!
//! The [`Registry`] is not installed as the global `metrics` recorder. It is
//! built once by the lifecycle controller and shared by reference with the
//! emission loop, which increments it, and the metrics server, which renders
//! it.

use metrics::{Counter, Key, KeyName, Level, Metadata, Recorder, SharedString, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use rustc_hash::FxHashMap;

/// Name of the bytes produced counter.
pub const BYTES_PRODUCED: &str = "generator_bytes_produced_total";
/// Name of the records produced counter.
pub const RECORDS_PRODUCED: &str = "generator_records_produced_total";
/// Name of the write failure counter.
pub const WRITE_FAILURES: &str = "generator_write_failures_total";

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// Owner of the generator's counters and their Prometheus rendering.
pub struct Registry {
    recorder: PrometheusRecorder,
    bytes_produced: Counter,
    records_produced: Counter,
    write_failures: Counter,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    /// Create a new [`Registry`], attaching `global_labels` to every series.
    #[must_use]
    pub fn new(global_labels: FxHashMap<String, String>) -> Self {
        let mut builder = PrometheusBuilder::new();
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        let recorder = builder.build_recorder();

        let counter = |name: &'static str, unit: Unit, help: &'static str| {
            recorder.describe_counter(KeyName::from(name), Some(unit), SharedString::from(help));
            recorder.register_counter(&Key::from_static_name(name), &METADATA)
        };
        let bytes_produced = counter(
            BYTES_PRODUCED,
            Unit::Bytes,
            "Total bytes produced by generator",
        );
        let records_produced = counter(
            RECORDS_PRODUCED,
            Unit::Count,
            "Total records produced by generator",
        );
        let write_failures = counter(
            WRITE_FAILURES,
            Unit::Count,
            "Payload or audit writes that failed",
        );

        Self {
            recorder,
            bytes_produced,
            records_produced,
            write_failures,
        }
    }

    /// Account for `records` freshly produced records totalling `bytes`.
    pub fn produced(&self, bytes: u64, records: u64) {
        self.bytes_produced.increment(bytes);
        self.records_produced.increment(records);
    }

    /// Account for one failed write.
    pub fn write_failed(&self) {
        self.write_failures.increment(1);
    }

    /// Render every counter in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        self.recorder.handle().render()
    }
}

/// Parse the value of an unlabeled series out of a rendered exposition.
///
/// Only used to read counters back in tests; labeled series are matched on
/// their name prefix.
#[cfg(test)]
pub(crate) fn sample(exposition: &str, name: &str) -> Option<u64> {
    exposition
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find(|line| {
            line.strip_prefix(name)
                .is_some_and(|rest| rest.starts_with(' ') || rest.starts_with('{'))
        })
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashMap;

    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let registry = Registry::new(FxHashMap::default());
        let out = registry.render();
        assert_eq!(sample(&out, BYTES_PRODUCED), Some(0));
        assert_eq!(sample(&out, RECORDS_PRODUCED), Some(0));
        assert_eq!(sample(&out, WRITE_FAILURES), Some(0));
    }

    #[test]
    fn produced_accumulates() {
        let registry = Registry::new(FxHashMap::default());
        registry.produced(1000, 2);
        registry.produced(1000, 2);
        registry.write_failed();

        let out = registry.render();
        assert!(out.contains("# TYPE generator_bytes_produced_total counter"));
        assert_eq!(sample(&out, BYTES_PRODUCED), Some(2000));
        assert_eq!(sample(&out, RECORDS_PRODUCED), Some(4));
        assert_eq!(sample(&out, WRITE_FAILURES), Some(1));
    }

    #[test]
    fn global_labels_are_attached() {
        let mut labels = FxHashMap::default();
        labels.insert("env".to_string(), "staging".to_string());
        let registry = Registry::new(labels);
        registry.produced(10, 1);

        let out = registry.render();
        assert!(out.contains(r#"generator_records_produced_total{env="staging"} 1"#));
        assert_eq!(sample(&out, RECORDS_PRODUCED), Some(1));
    }
}
