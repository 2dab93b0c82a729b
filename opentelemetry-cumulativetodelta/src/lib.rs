//! # OpenTelemetry Cumulative-to-Delta Processor
//!
//! A metrics pipeline stage that converts cumulative sum metrics into
//! delta temporality.
//!
//! Many telemetry sources report sums as running totals since process
//! start. Downstream systems often want the change between consecutive
//! reports instead. This crate rewrites metric batches in place: each
//! cumulative sum data point is matched to its logical time series, the
//! delta since the series' previous observation is computed (detecting
//! counter resets on monotonic series), and the point's value and start
//! timestamp are replaced before the batch is forwarded.
//!
//! A time series is identified by the full structural identity of its
//! data points: resource attributes, instrumentation scope, metric
//! name/unit/value type, monotonicity, the point's attribute set, and
//! its reported start timestamp. Attribute ordering never matters.
//!
//! Per-series tracking state lives in memory only. An optional staleness
//! window bounds its growth: series unobserved for longer than the
//! window are swept out by a background thread that stops on
//! [`shutdown`].
//!
//! # Getting started
//!
//! ```
//! use std::time::{Duration, SystemTime};
//!
//! use opentelemetry::{InstrumentationScope, KeyValue};
//! use opentelemetry_cumulativetodelta::data::{
//!     AggregatedMetrics, Metric, MetricData, ResourceMetrics, ScopeMetrics, Sum, SumDataPoint,
//!     Temporality,
//! };
//! use opentelemetry_cumulativetodelta::CumulativeToDeltaProcessor;
//! use opentelemetry_sdk::Resource;
//!
//! let processor = CumulativeToDeltaProcessor::builder()
//!     .with_max_stale(Duration::from_secs(600))
//!     .build()
//!     .unwrap();
//!
//! let start = SystemTime::now();
//! let mut batch = vec![ResourceMetrics {
//!     resource: Resource::builder_empty()
//!         .with_attribute(KeyValue::new("service.name", "checkout"))
//!         .build(),
//!     scope_metrics: vec![ScopeMetrics {
//!         scope: InstrumentationScope::builder("example").build(),
//!         metrics: vec![Metric {
//!             name: "requests.total".into(),
//!             description: "".into(),
//!             unit: "1".into(),
//!             data: AggregatedMetrics::F64(MetricData::Sum(Sum {
//!                 data_points: vec![SumDataPoint {
//!                     attributes: vec![KeyValue::new("code", "200")],
//!                     start_time: start,
//!                     time: SystemTime::now(),
//!                     value: 42.0,
//!                 }],
//!                 temporality: Temporality::Cumulative,
//!                 is_monotonic: true,
//!             })),
//!         }],
//!     }],
//! }];
//!
//! processor.process(&mut batch);
//! // The batch now carries delta temporality; forward it downstream.
//! processor.shutdown().unwrap();
//! ```
//!
//! [`shutdown`]: CumulativeToDeltaProcessor::shutdown
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(test, deny(warnings))]

pub mod data;
mod error;
mod identity;
mod processor;
mod tracker;

pub use error::Error;
pub use identity::SeriesIdentity;
pub use processor::{CumulativeToDeltaProcessor, CumulativeToDeltaProcessorBuilder};
pub use tracker::{DeltaPoint, DeltaTracker, Observation};
