//! The pipeline stage that rewrites cumulative sums into deltas in place.

use std::collections::HashSet;
use std::env;
use std::time::Duration;

use opentelemetry::{otel_debug, InstrumentationScope};
use opentelemetry_sdk::Resource;

use crate::data::{
    AggregatedMetrics, Metric, MetricData, Number, ResourceMetrics, Sum, Temporality,
};
use crate::error::Error;
use crate::identity::SeriesIdentity;
use crate::tracker::{DeltaTracker, Observation};

const MAX_STALE_ENV: &str = "OTEL_METRIC_CUMULATIVE_TO_DELTA_MAX_STALE";

/// Configuration options for [CumulativeToDeltaProcessor].
///
/// By default every cumulative sum in a batch is converted and tracking
/// state is kept forever. A staleness window bounds memory growth for
/// high-churn label sets; a metric list narrows conversion to the named
/// metrics only.
#[derive(Debug)]
pub struct CumulativeToDeltaProcessorBuilder {
    max_stale: Duration,
    monotonic_only: bool,
    metrics: Option<Vec<String>>,
}

impl CumulativeToDeltaProcessorBuilder {
    fn new() -> Self {
        let max_stale = env::var(MAX_STALE_ENV)
            .ok()
            .and_then(|value| value.parse().map(Duration::from_millis).ok())
            .unwrap_or(Duration::ZERO);
        CumulativeToDeltaProcessorBuilder {
            max_stale,
            monotonic_only: false,
            metrics: None,
        }
    }

    /// How long a series may go unobserved before its tracking state is
    /// discarded. Zero disables expiry and series accumulate for the
    /// lifetime of the process.
    ///
    /// This option overrides any value set for the
    /// `OTEL_METRIC_CUMULATIVE_TO_DELTA_MAX_STALE` environment variable
    /// (milliseconds).
    pub fn with_max_stale(mut self, max_stale: Duration) -> Self {
        self.max_stale = max_stale;
        self
    }

    /// Convert only monotonic sums, passing non-monotonic cumulative
    /// sums through unchanged.
    pub fn with_monotonic_only(mut self, monotonic_only: bool) -> Self {
        self.monotonic_only = monotonic_only;
        self
    }

    /// Restrict conversion to the named metrics; everything else passes
    /// through unchanged. An empty list behaves like no list at all:
    /// every eligible metric is converted.
    pub fn with_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metrics = Some(metrics.into_iter().map(Into::into).collect());
        self
    }

    /// Builds the processor, starting the stale-series reaper when a
    /// staleness window is configured.
    pub fn build(self) -> Result<CumulativeToDeltaProcessor, Error> {
        let enabled_metrics = match self.metrics {
            Some(names) => {
                if names.iter().any(|name| name.is_empty()) {
                    return Err(Error::Config(
                        "metric names in the conversion list must not be empty".to_string(),
                    ));
                }
                if names.is_empty() {
                    None
                } else {
                    Some(names.into_iter().collect::<HashSet<_>>())
                }
            }
            None => None,
        };

        Ok(CumulativeToDeltaProcessor {
            tracker: DeltaTracker::new(self.max_stale),
            monotonic_only: self.monotonic_only,
            enabled_metrics,
        })
    }
}

/// A metrics pipeline stage that rewrites cumulative sums into delta
/// temporality.
///
/// [`process`] mutates a batch in place: each cumulative sum data point
/// is matched to its logical series, its value becomes the change since
/// the series' previous observation (with counter resets detected on
/// monotonic series), and its start timestamp becomes the previous
/// observation time. Points with no valid delta yet are dropped, and
/// containers left empty are stripped from the batch. Gauges,
/// delta-temporality sums, and metrics excluded by configuration pass
/// through untouched.
///
/// The processor is safe to share across concurrent pipeline workers.
///
/// [`process`]: CumulativeToDeltaProcessor::process
#[derive(Debug)]
pub struct CumulativeToDeltaProcessor {
    tracker: DeltaTracker,
    monotonic_only: bool,
    enabled_metrics: Option<HashSet<String>>,
}

impl CumulativeToDeltaProcessor {
    /// Configuration options for the processor.
    pub fn builder() -> CumulativeToDeltaProcessorBuilder {
        CumulativeToDeltaProcessorBuilder::new()
    }

    /// Rewrites every eligible cumulative sum in `batch` to delta
    /// temporality, dropping points with no valid delta yet and
    /// stripping metrics, scopes, and resource entries left empty.
    pub fn process(&self, batch: &mut Vec<ResourceMetrics>) {
        batch.retain_mut(|resource_metrics| {
            let resource = &resource_metrics.resource;
            resource_metrics.scope_metrics.retain_mut(|scope_metrics| {
                let scope = &scope_metrics.scope;
                scope_metrics.metrics.retain_mut(|metric| {
                    if let Some(enabled) = &self.enabled_metrics {
                        if !enabled.contains(metric.name.as_ref()) {
                            return true;
                        }
                    }
                    self.convert_metric(resource, scope, metric)
                });
                !scope_metrics.metrics.is_empty()
            });
            !resource_metrics.scope_metrics.is_empty()
        });
    }

    /// Stops the background stale-series reaper, waiting for it to
    /// acknowledge. Returns an error when called more than once.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.tracker.shutdown()
    }

    // Returns whether the metric should be kept in the batch.
    fn convert_metric(
        &self,
        resource: &Resource,
        scope: &InstrumentationScope,
        metric: &mut Metric,
    ) -> bool {
        let Metric {
            name,
            description,
            unit,
            data,
        } = metric;
        match data {
            AggregatedMetrics::F64(MetricData::Sum(sum)) => {
                self.convert_sum(resource, scope, name, description, unit, sum)
            }
            AggregatedMetrics::I64(MetricData::Sum(sum)) => {
                self.convert_sum(resource, scope, name, description, unit, sum)
            }
            // Anything that is not a sum flows through untouched.
            _ => true,
        }
    }

    fn convert_sum<T: Number>(
        &self,
        resource: &Resource,
        scope: &InstrumentationScope,
        name: &str,
        description: &str,
        unit: &str,
        sum: &mut Sum<T>,
    ) -> bool {
        if sum.temporality != Temporality::Cumulative {
            return true;
        }
        if self.monotonic_only && !sum.is_monotonic {
            return true;
        }

        let is_monotonic = sum.is_monotonic;
        sum.data_points.retain_mut(|point| {
            let observation = Observation {
                identity: SeriesIdentity {
                    resource,
                    scope,
                    kind: T::sum_kind(),
                    is_monotonic,
                    name,
                    description,
                    unit,
                    attributes: &point.attributes,
                    start_time: point.start_time,
                },
                time: point.time,
                value: point.value.into_number(),
            };
            match self.tracker.convert(&observation) {
                Some(delta) => {
                    otel_debug!(
                        name: "CumulativeToDeltaPointConverted",
                        metric_name = name,
                        delta = delta.value.to_string()
                    );
                    point.start_time = delta.start_time;
                    point.value = T::from_number(delta.value);
                    true
                }
                None => {
                    otel_debug!(
                        name: "CumulativeToDeltaPointDropped",
                        metric_name = name
                    );
                    false
                }
            }
        });
        sum.temporality = Temporality::Delta;
        !sum.data_points.is_empty()
    }
}
