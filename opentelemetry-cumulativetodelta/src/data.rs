//! In-memory representation of a metrics batch flowing through the
//! pipeline stage.
//!
//! Batches follow the resource → scope → metric → data point nesting of
//! the metrics data model. The processor rewrites this tree in place and
//! the caller forwards it downstream.

use std::{borrow::Cow, fmt, time::SystemTime};

use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::Resource;

/// Describes if the aggregation is reported as the change from the last
/// report time, or the cumulative changes since a fixed start time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Temporality {
    /// A measurement interval that continues to expand forward in time
    /// from a starting point.
    ///
    /// New measurements are added to all previous measurements since a
    /// start time.
    #[default]
    Cumulative,

    /// A measurement interval that resets each cycle.
    ///
    /// Measurements from one cycle are recorded independently,
    /// measurements from other cycles do not affect them.
    Delta,
}

/// A collection of [ScopeMetrics] and the associated [Resource] that created them.
#[derive(Debug)]
pub struct ResourceMetrics {
    /// The entity that collected the metrics.
    pub resource: Resource,
    /// The collection of metrics with unique [InstrumentationScope]s.
    pub scope_metrics: Vec<ScopeMetrics>,
}

/// A collection of metrics produced by a meter.
#[derive(Default, Debug)]
pub struct ScopeMetrics {
    /// The [InstrumentationScope] that the meter was created with.
    pub scope: InstrumentationScope,
    /// The list of aggregations created by the meter.
    pub metrics: Vec<Metric>,
}

/// A collection of one or more aggregated time series from an instrument.
#[derive(Debug)]
pub struct Metric {
    /// The name of the instrument that created this data.
    pub name: Cow<'static, str>,
    /// The description of the instrument, which can be used in documentation.
    pub description: Cow<'static, str>,
    /// The unit in which the instrument reports.
    pub unit: Cow<'static, str>,
    /// The aggregated data from an instrument.
    pub data: AggregatedMetrics,
}

/// Aggregated metrics data from an instrument.
#[derive(Debug)]
pub enum AggregatedMetrics {
    /// All metric data with `f64` value type
    F64(MetricData<f64>),
    /// All metric data with `i64` value type
    I64(MetricData<i64>),
}

/// Metric data for all types
#[derive(Debug)]
pub enum MetricData<T> {
    /// Metric data for Gauge
    Gauge(Gauge<T>),
    /// Metric data for Sum
    Sum(Sum<T>),
}

impl From<MetricData<f64>> for AggregatedMetrics {
    fn from(value: MetricData<f64>) -> Self {
        AggregatedMetrics::F64(value)
    }
}

impl From<MetricData<i64>> for AggregatedMetrics {
    fn from(value: MetricData<i64>) -> Self {
        AggregatedMetrics::I64(value)
    }
}

impl<T> From<Gauge<T>> for MetricData<T> {
    fn from(value: Gauge<T>) -> Self {
        MetricData::Gauge(value)
    }
}

impl<T> From<Sum<T>> for MetricData<T> {
    fn from(value: Sum<T>) -> Self {
        MetricData::Sum(value)
    }
}

/// A measurement of the current value of an instrument.
#[derive(Debug, Clone)]
pub struct Gauge<T> {
    /// Represents individual aggregated measurements with unique attributes.
    pub data_points: Vec<GaugeDataPoint<T>>,
}

/// A single gauge data point in a time series.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeDataPoint<T> {
    /// The set of key value pairs that uniquely identify the time series.
    pub attributes: Vec<KeyValue>,
    /// The time when the value was recorded.
    pub time: SystemTime,
    /// The value of this data point.
    pub value: T,
}

/// Represents the sum of all measurements of values from an instrument.
#[derive(Debug, Clone)]
pub struct Sum<T> {
    /// Represents individual aggregated measurements with unique attributes.
    pub data_points: Vec<SumDataPoint<T>>,
    /// Describes if the aggregation is reported as the change from the last
    /// report time, or the cumulative changes since a fixed start time.
    pub temporality: Temporality,
    /// Whether this aggregation only increases or decreases.
    pub is_monotonic: bool,
}

/// A single sum data point in a time series.
#[derive(Debug, Clone, PartialEq)]
pub struct SumDataPoint<T> {
    /// The set of key value pairs that uniquely identify the time series.
    pub attributes: Vec<KeyValue>,
    /// The time when the time series was started.
    pub start_time: SystemTime,
    /// The time when the value was recorded.
    pub time: SystemTime,
    /// The value of this data point.
    pub value: T,
}

/// Discriminates the aggregation shape and value type of a metric stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Gauge over `f64` values.
    F64Gauge,
    /// Sum over `f64` values.
    F64Sum,
    /// Gauge over `i64` values.
    I64Gauge,
    /// Sum over `i64` values.
    I64Sum,
}

impl MetricKind {
    /// Whether this kind is one of the sum kinds eligible for
    /// cumulative-to-delta conversion.
    pub fn is_sum(&self) -> bool {
        matches!(self, MetricKind::F64Sum | MetricKind::I64Sum)
    }

    // Single character written into the canonical key.
    pub(crate) fn tag(&self) -> char {
        (b'A' + *self as u8) as char
    }
}

/// A numeric value carrying an explicit kind tag.
///
/// Tracked series store their last reading in this form, so the value
/// type a stream was established with is always visible to the
/// conversion arithmetic.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NumberValue {
    /// A 64-bit floating point value.
    F64(f64),
    /// A signed 64-bit integer value.
    I64(i64),
}

impl fmt::Display for NumberValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberValue::F64(value) => value.fmt(f),
            NumberValue::I64(value) => value.fmt(f),
        }
    }
}

impl From<f64> for NumberValue {
    fn from(value: f64) -> Self {
        NumberValue::F64(value)
    }
}

impl From<i64> for NumberValue {
    fn from(value: i64) -> Self {
        NumberValue::I64(value)
    }
}

/// Data point value types the converter understands.
pub(crate) trait Number: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// The sum kind for streams of this value type.
    fn sum_kind() -> MetricKind;

    /// Wraps the value with its kind tag.
    fn into_number(self) -> NumberValue;

    /// Unwraps a tagged value of this type.
    ///
    /// Panics when the tag does not match. A series must not change value
    /// type once established; the caller is responsible for consistency.
    fn from_number(value: NumberValue) -> Self;
}

impl Number for f64 {
    fn sum_kind() -> MetricKind {
        MetricKind::F64Sum
    }

    fn into_number(self) -> NumberValue {
        NumberValue::F64(self)
    }

    fn from_number(value: NumberValue) -> Self {
        match value {
            NumberValue::F64(value) => value,
            other => panic!("expected an f64 value, got {other:?}"),
        }
    }
}

impl Number for i64 {
    fn sum_kind() -> MetricKind {
        MetricKind::I64Sum
    }

    fn into_number(self) -> NumberValue {
        NumberValue::I64(self)
    }

    fn from_number(value: NumberValue) -> Self {
        match value {
            NumberValue::I64(value) => value,
            other => panic!("expected an i64 value, got {other:?}"),
        }
    }
}
