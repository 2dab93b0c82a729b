//! Canonical identity of a metric time series.

use std::cell::RefCell;
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::Resource;

use crate::data::MetricKind;

// Key buffers start at 64 bytes, enough for typical identities.
const INITIAL_KEY_CAPACITY: usize = 64;

thread_local! {
    static KEY_BUFFER: RefCell<String> = RefCell::new(String::with_capacity(INITIAL_KEY_CAPACITY));
}

/// The structural identity of a single time series within a batch.
///
/// Two observations belong to the same logical series when every field
/// here compares equal, independent of the order attributes were
/// supplied in. Everything is borrowed from the batch being processed;
/// nothing is copied until a series is first tracked.
#[derive(Debug, Clone, Copy)]
pub struct SeriesIdentity<'a> {
    /// Attributes of the entity that produced the metric.
    pub resource: &'a Resource,
    /// The instrumentation scope that reported the metric.
    pub scope: &'a InstrumentationScope,
    /// The aggregation shape and value type of the stream.
    pub kind: MetricKind,
    /// Whether the stream is defined to never decrease except via reset.
    pub is_monotonic: bool,
    /// Metric name.
    pub name: &'a str,
    /// Metric description. Not part of the canonical key.
    pub description: &'a str,
    /// Metric unit.
    pub unit: &'a str,
    /// The data point's attribute set.
    pub attributes: &'a [KeyValue],
    /// The start timestamp reported by the source. Distinguishes series
    /// that reset and restarted.
    pub start_time: SystemTime,
}

impl SeriesIdentity<'_> {
    /// Encodes this identity into its canonical key.
    ///
    /// The encoding is deterministic: resource attributes and data point
    /// attributes are sorted by key before writing, so permuted input
    /// always produces the identical key, and any change to a field that
    /// is part of the identity produces a different key.
    pub fn encode(&self) -> String {
        let mut key = String::with_capacity(INITIAL_KEY_CAPACITY);
        self.encode_into(&mut key);
        key
    }

    // Encodes into `buf`, clearing it first, so hot paths can reuse a
    // scratch buffer instead of allocating per observation.
    fn encode_into(&self, buf: &mut String) {
        buf.clear();
        buf.push_str("t;");
        buf.push(self.kind.tag());
        buf.push(if self.is_monotonic { 'M' } else { 'C' });

        buf.push_str(";r");
        let mut resource_attrs: Vec<_> = self.resource.iter().collect();
        resource_attrs.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (key, value) in resource_attrs {
            buf.push(';');
            buf.push_str(key.as_str());
            buf.push(';');
            buf.push_str(&value.as_str());
        }

        buf.push_str(";i;");
        buf.push_str(self.scope.name());
        buf.push(';');
        buf.push_str(self.scope.version().unwrap_or(""));

        buf.push_str(";m;");
        buf.push_str(self.name);
        buf.push(';');
        buf.push_str(self.unit);

        buf.push_str(";l");
        let mut attrs: Vec<_> = self.attributes.iter().collect();
        attrs.sort_by(|a, b| a.key.cmp(&b.key));
        for kv in attrs {
            buf.push(';');
            buf.push_str(kv.key.as_str());
            buf.push(';');
            buf.push_str(&kv.value.as_str());
        }

        buf.push_str(";s;");
        let nanos = self
            .start_time
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        let _ = write!(buf, "{nanos:x}");
    }

    // Runs `f` with the canonical key encoded into a thread-local
    // scratch buffer.
    pub(crate) fn with_key<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        KEY_BUFFER.with(|buf| {
            let mut buf = buf.borrow_mut();
            self.encode_into(&mut buf);
            f(&buf)
        })
    }
}
