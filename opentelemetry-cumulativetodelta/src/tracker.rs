//! Per-series state tracking and cumulative-to-delta conversion.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, SystemTime};

use opentelemetry::{otel_debug, otel_error, otel_info};

use crate::data::NumberValue;
use crate::error::Error;
use crate::identity::SeriesIdentity;

/// A single timestamped reading of a series, as reported by the source.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    /// Identity of the series the reading belongs to.
    pub identity: SeriesIdentity<'a>,
    /// When the reading was observed.
    pub time: SystemTime,
    /// The cumulative value reported by the source.
    pub value: NumberValue,
}

/// The replacement data computed for an emitted point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaPoint {
    /// The new start timestamp: when the previous observation of this
    /// series was made.
    pub start_time: SystemTime,
    /// The change since the previous observation.
    pub value: NumberValue,
}

// Last accepted reading of a tracked series.
#[derive(Debug, Clone, Copy)]
struct LatestPoint {
    time: SystemTime,
    value: NumberValue,
}

// Mutable state of one tracked series. The map only ever hands out the
// same `Arc`; every reader and writer goes through `latest`'s lock.
#[derive(Debug)]
struct SeriesState {
    latest: Mutex<LatestPoint>,
}

enum Message {
    Shutdown(Sender<bool>),
}

/// Converts cumulative readings into deltas, one logical series at a
/// time.
///
/// Tracking state lives in memory only. When constructed with a non-zero
/// staleness window, a background thread periodically sweeps out series
/// that have not been observed within the window; with a zero window,
/// series are tracked for the lifetime of the process.
///
/// Conversions for the same series are serialized through that series'
/// own lock; conversions for different series proceed in parallel.
#[derive(Clone, Debug)]
pub struct DeltaTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    states: RwLock<HashMap<String, Arc<SeriesState>>>,
    message_sender: Option<Sender<Message>>,
    is_shutdown: AtomicBool,
}

impl DeltaTracker {
    /// Creates a tracker. A non-zero `max_stale` starts the stale-series
    /// sweep thread on that period.
    pub fn new(max_stale: Duration) -> Self {
        if max_stale.is_zero() {
            return DeltaTracker {
                inner: Arc::new(TrackerInner {
                    states: RwLock::new(HashMap::new()),
                    message_sender: None,
                    is_shutdown: AtomicBool::new(false),
                }),
            };
        }

        let (message_sender, message_receiver) = mpsc::channel();
        let tracker = DeltaTracker {
            inner: Arc::new(TrackerInner {
                states: RwLock::new(HashMap::new()),
                message_sender: Some(message_sender),
                is_shutdown: AtomicBool::new(false),
            }),
        };

        // The thread holds a weak handle so an abandoned tracker does not
        // keep its own reaper alive; dropping the last tracker clone also
        // disconnects the channel and wakes the loop.
        let weak_inner = Arc::downgrade(&tracker.inner);
        let result_thread_creation = thread::Builder::new()
            .name("OpenTelemetry.Metrics.CumulativeToDeltaReaper".to_string())
            .spawn(move || {
                otel_info!(
                    name: "CumulativeToDeltaReaperStarted",
                    interval = max_stale.as_millis()
                );
                loop {
                    match message_receiver.recv_timeout(max_stale) {
                        Ok(Message::Shutdown(response_sender)) => {
                            let _ = response_sender.send(true);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(inner) = weak_inner.upgrade() else {
                                break;
                            };
                            let now = opentelemetry::time::now();
                            if let Some(stale_before) = now.checked_sub(max_stale) {
                                let evicted = inner.remove_stale(stale_before);
                                otel_debug!(
                                    name: "CumulativeToDeltaStaleSweep",
                                    evicted = evicted,
                                    tracked = inner.series_count()
                                );
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                otel_info!(name: "CumulativeToDeltaReaperStopped");
            });

        if let Err(err) = result_thread_creation {
            otel_error!(
                name: "CumulativeToDeltaReaperStartError",
                error = format!("{err:?}")
            );
        }
        tracker
    }

    /// Converts one observation into the replacement start timestamp and
    /// delta value for the outgoing point.
    ///
    /// Returns `None` when the point must be dropped: the metric kind is
    /// not a convertible sum, or this is the first observation of a
    /// non-monotonic series and there is no baseline to delta against.
    /// The first observation of a monotonic series is emitted as-is,
    /// with the observation's own timestamp as the start.
    ///
    /// # Panics
    ///
    /// Panics if the observation's value type differs from the type this
    /// series was established with. A series must not switch value types;
    /// this is a caller bug, not a runtime condition.
    pub fn convert(&self, observation: &Observation<'_>) -> Option<DeltaPoint> {
        let identity = &observation.identity;
        if !identity.kind.is_sum() {
            return None;
        }

        let (state, existed) = identity.with_key(|key| self.inner.get_or_create(key, observation));
        if !existed {
            if identity.is_monotonic {
                // The first point establishes a zero baseline.
                return Some(DeltaPoint {
                    start_time: observation.time,
                    value: observation.value,
                });
            }
            return None;
        }

        let mut latest = state.latest.lock().expect("series lock poisoned");
        let start_time = latest.time;
        let value = delta_between(latest.value, observation.value, identity.is_monotonic);
        *latest = LatestPoint {
            time: observation.time,
            value: observation.value,
        };
        Some(DeltaPoint { start_time, value })
    }

    /// Removes every series whose last accepted observation precedes
    /// `stale_before`, returning how many were evicted.
    ///
    /// A series can be updated concurrently with a sweep. Either the
    /// update commits first and the refreshed timestamp keeps the series
    /// alive, or the eviction wins and the next observation of that
    /// identity starts a fresh baseline as if it were the first ever
    /// seen. Data is never duplicated or corrupted under this race.
    pub fn remove_stale(&self, stale_before: SystemTime) -> usize {
        self.inner.remove_stale(stale_before)
    }

    /// Number of series currently tracked.
    pub fn series_count(&self) -> usize {
        self.inner.series_count()
    }

    /// Stops the stale-series sweep thread, if one is running, and waits
    /// for it to acknowledge. Evictions already performed are not rolled
    /// back. Returns an error when called more than once.
    pub fn shutdown(&self) -> Result<(), Error> {
        if self.inner.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(Error::AlreadyShutdown);
        }
        let Some(sender) = &self.inner.message_sender else {
            // Expiry disabled, no thread to stop.
            return Ok(());
        };

        let (response_tx, response_rx) = mpsc::channel();
        sender
            .send(Message::Shutdown(response_tx))
            .map_err(|err| Error::Other(err.to_string()))?;
        match response_rx.recv() {
            Ok(true) => Ok(()),
            _ => Err(Error::Other(
                "stale series reaper failed to acknowledge shutdown".to_string(),
            )),
        }
    }
}

impl TrackerInner {
    // Fetches the state for `key`, atomically creating it from this
    // observation when the key was never seen. Exactly one concurrent
    // first observation wins the insert; the others receive the winner's
    // state with `existed` set.
    fn get_or_create(&self, key: &str, observation: &Observation<'_>) -> (Arc<SeriesState>, bool) {
        if let Some(state) = self
            .states
            .read()
            .expect("state map lock poisoned")
            .get(key)
        {
            return (state.clone(), true);
        }

        let mut states = self.states.write().expect("state map lock poisoned");
        match states.entry(key.to_owned()) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                let state = Arc::new(SeriesState {
                    latest: Mutex::new(LatestPoint {
                        time: observation.time,
                        value: observation.value,
                    }),
                });
                entry.insert(state.clone());
                (state, false)
            }
        }
    }

    fn remove_stale(&self, stale_before: SystemTime) -> usize {
        // Snapshot the stale keys under brief per-series locks. An update
        // that lands after this read but before the removal below loses
        // its state; the series re-baselines on its next observation.
        let stale: Vec<String> = {
            let states = self.states.read().expect("state map lock poisoned");
            states
                .iter()
                .filter(|(_, state)| {
                    let latest = state.latest.lock().expect("series lock poisoned");
                    latest.time < stale_before
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        if stale.is_empty() {
            return 0;
        }

        let mut states = self.states.write().expect("state map lock poisoned");
        for key in &stale {
            states.remove(key);
        }
        stale.len()
    }

    fn series_count(&self) -> usize {
        self.states.read().expect("state map lock poisoned").len()
    }
}

// Computes the change between consecutive readings of one series. A
// monotonic series whose value moved backwards restarted from zero, so
// the reading itself is the change.
fn delta_between(previous: NumberValue, current: NumberValue, is_monotonic: bool) -> NumberValue {
    match (previous, current) {
        (NumberValue::F64(previous), NumberValue::F64(current)) => {
            if is_monotonic && current < previous {
                NumberValue::F64(current)
            } else {
                NumberValue::F64(current - previous)
            }
        }
        (NumberValue::I64(previous), NumberValue::I64(current)) => {
            if is_monotonic && current < previous {
                NumberValue::I64(current)
            } else {
                NumberValue::I64(current - previous)
            }
        }
        (previous, current) => panic!(
            "series value type changed between observations: {previous:?} then {current:?}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use opentelemetry::{InstrumentationScope, KeyValue};
    use opentelemetry_sdk::Resource;
    use rstest::rstest;

    use super::*;
    use crate::data::MetricKind;

    fn ts(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    struct SeriesFixture {
        resource: Resource,
        scope: InstrumentationScope,
        attributes: Vec<KeyValue>,
    }

    impl SeriesFixture {
        fn new(label: &'static str) -> Self {
            SeriesFixture {
                resource: Resource::builder_empty()
                    .with_attribute(KeyValue::new("service.name", "checkout"))
                    .build(),
                scope: InstrumentationScope::builder("testlib")
                    .with_version("1.0.0")
                    .build(),
                attributes: vec![KeyValue::new("code", label)],
            }
        }

        fn observation(
            &self,
            kind: MetricKind,
            is_monotonic: bool,
            time: SystemTime,
            value: NumberValue,
        ) -> Observation<'_> {
            Observation {
                identity: SeriesIdentity {
                    resource: &self.resource,
                    scope: &self.scope,
                    kind,
                    is_monotonic,
                    name: "requests.total",
                    description: "total requests served",
                    unit: "1",
                    attributes: &self.attributes,
                    start_time: ts(1),
                },
                time,
                value,
            }
        }
    }

    #[test]
    fn first_monotonic_point_establishes_baseline() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        let delta = tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(100), NumberValue::F64(10.0)))
            .expect("first monotonic point is emitted");

        assert_eq!(delta.start_time, ts(100));
        assert_eq!(delta.value, NumberValue::F64(10.0));
        assert_eq!(tracker.series_count(), 1);
    }

    #[test]
    fn first_non_monotonic_point_is_dropped_but_tracked() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        let first = tracker.convert(&series.observation(
            MetricKind::F64Sum,
            false,
            ts(100),
            NumberValue::F64(10.0),
        ));
        assert!(first.is_none());
        assert_eq!(tracker.series_count(), 1);

        // The dropped point still seeded the baseline.
        let second = tracker
            .convert(&series.observation(
                MetricKind::F64Sum,
                false,
                ts(200),
                NumberValue::F64(15.0),
            ))
            .expect("second point has a baseline");
        assert_eq!(second.start_time, ts(100));
        assert_eq!(second.value, NumberValue::F64(5.0));
    }

    #[test]
    fn monotonic_steady_increase() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(100), NumberValue::F64(10.0)))
            .unwrap();
        let delta = tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(200), NumberValue::F64(15.0)))
            .unwrap();

        assert_eq!(delta.start_time, ts(100));
        assert_eq!(delta.value, NumberValue::F64(5.0));
    }

    #[test]
    fn monotonic_counter_reset_emits_current_value() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(200), NumberValue::F64(15.0)))
            .unwrap();
        let delta = tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(300), NumberValue::F64(3.0)))
            .unwrap();

        assert_eq!(delta.start_time, ts(200));
        assert_eq!(delta.value, NumberValue::F64(3.0));
    }

    #[test]
    fn non_monotonic_decrease_goes_negative() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        tracker.convert(&series.observation(
            MetricKind::F64Sum,
            false,
            ts(200),
            NumberValue::F64(15.0),
        ));
        let delta = tracker
            .convert(&series.observation(
                MetricKind::F64Sum,
                false,
                ts(300),
                NumberValue::F64(3.0),
            ))
            .unwrap();

        assert_eq!(delta.start_time, ts(200));
        assert_eq!(delta.value, NumberValue::F64(-12.0));
    }

    #[test]
    fn integer_sums_use_integer_arithmetic() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        tracker
            .convert(&series.observation(MetricKind::I64Sum, true, ts(100), NumberValue::I64(10)))
            .unwrap();
        let delta = tracker
            .convert(&series.observation(MetricKind::I64Sum, true, ts(200), NumberValue::I64(15)))
            .unwrap();

        assert_eq!(delta.value, NumberValue::I64(5));
    }

    #[test]
    fn unsupported_kinds_are_rejected_without_state() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        let result = tracker.convert(&series.observation(
            MetricKind::F64Gauge,
            false,
            ts(100),
            NumberValue::F64(10.0),
        ));
        assert!(result.is_none());
        assert_eq!(tracker.series_count(), 0);
    }

    #[test]
    #[should_panic(expected = "value type changed")]
    fn value_type_change_panics() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(100), NumberValue::F64(10.0)))
            .unwrap();
        tracker.convert(&series.observation(MetricKind::F64Sum, true, ts(200), NumberValue::I64(15)));
    }

    #[test]
    fn distinct_series_do_not_cross_contaminate() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let ok = SeriesFixture::new("200");
        let errors = SeriesFixture::new("500");

        tracker
            .convert(&ok.observation(MetricKind::I64Sum, true, ts(100), NumberValue::I64(10)))
            .unwrap();
        tracker
            .convert(&errors.observation(MetricKind::I64Sum, true, ts(110), NumberValue::I64(1)))
            .unwrap();
        let ok_delta = tracker
            .convert(&ok.observation(MetricKind::I64Sum, true, ts(200), NumberValue::I64(25)))
            .unwrap();
        let errors_delta = tracker
            .convert(&errors.observation(MetricKind::I64Sum, true, ts(210), NumberValue::I64(4)))
            .unwrap();

        assert_eq!(ok_delta.value, NumberValue::I64(15));
        assert_eq!(ok_delta.start_time, ts(100));
        assert_eq!(errors_delta.value, NumberValue::I64(3));
        assert_eq!(errors_delta.start_time, ts(110));
        assert_eq!(tracker.series_count(), 2);
    }

    #[test]
    fn stale_series_are_evicted_and_rebaseline() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(100), NumberValue::F64(10.0)))
            .unwrap();
        assert_eq!(tracker.remove_stale(ts(150)), 1);
        assert_eq!(tracker.series_count(), 0);

        // Observing the identity again behaves like a brand-new series.
        let delta = tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(300), NumberValue::F64(20.0)))
            .expect("fresh baseline after eviction");
        assert_eq!(delta.start_time, ts(300));
        assert_eq!(delta.value, NumberValue::F64(20.0));
    }

    #[test]
    fn active_series_survive_a_sweep() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(100), NumberValue::F64(10.0)))
            .unwrap();
        assert_eq!(tracker.remove_stale(ts(50)), 0);
        assert_eq!(tracker.series_count(), 1);
    }

    #[rstest]
    #[case(NumberValue::F64(15.0), NumberValue::F64(20.0), true, NumberValue::F64(5.0))]
    #[case(NumberValue::F64(15.0), NumberValue::F64(3.0), true, NumberValue::F64(3.0))]
    #[case(NumberValue::F64(15.0), NumberValue::F64(3.0), false, NumberValue::F64(-12.0))]
    #[case(NumberValue::I64(15), NumberValue::I64(20), true, NumberValue::I64(5))]
    #[case(NumberValue::I64(15), NumberValue::I64(3), true, NumberValue::I64(3))]
    #[case(NumberValue::I64(15), NumberValue::I64(3), false, NumberValue::I64(-12))]
    fn delta_arithmetic(
        #[case] previous: NumberValue,
        #[case] current: NumberValue,
        #[case] monotonic: bool,
        #[case] expected: NumberValue,
    ) {
        assert_eq!(delta_between(previous, current, monotonic), expected);
    }

    #[test]
    fn concurrent_series_convert_independently() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let ok = SeriesFixture::new("200");
        let errors = SeriesFixture::new("500");

        thread::scope(|scope| {
            for series in [&ok, &errors] {
                let tracker = tracker.clone();
                scope.spawn(move || {
                    let mut deltas = Vec::new();
                    for i in 1..=100i64 {
                        let delta = tracker
                            .convert(&series.observation(
                                MetricKind::I64Sum,
                                true,
                                ts(i as u64),
                                NumberValue::I64(i),
                            ))
                            .unwrap();
                        deltas.push(delta.value);
                    }
                    // Every step increments by exactly one, including the
                    // first point's raw emission.
                    assert!(deltas.iter().all(|value| *value == NumberValue::I64(1)));
                });
            }
        });
        assert_eq!(tracker.series_count(), 2);
    }

    #[test]
    fn concurrent_first_observation_has_one_winner() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        let mut emitted = Vec::new();
        thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let tracker = tracker.clone();
                    let series = &series;
                    scope.spawn(move || {
                        tracker
                            .convert(&series.observation(
                                MetricKind::I64Sum,
                                true,
                                ts(100),
                                NumberValue::I64(10),
                            ))
                            .unwrap()
                    })
                })
                .collect();
            for handle in handles {
                emitted.push(handle.join().unwrap());
            }
        });

        // Exactly one observer wins the insert and reports the raw value;
        // the rest delta against the winner's committed state.
        let total: i64 = emitted
            .iter()
            .map(|delta| match delta.value {
                NumberValue::I64(value) => value,
                other => panic!("unexpected value type {other:?}"),
            })
            .sum();
        assert_eq!(total, 10);
        assert_eq!(tracker.series_count(), 1);
    }

    #[test]
    fn reaper_thread_sweeps_unobserved_series() {
        let max_stale = Duration::from_millis(50);
        let tracker = DeltaTracker::new(max_stale);
        let series = SeriesFixture::new("200");

        // Observed far enough in the past to be stale on the first sweep.
        let observed_at = opentelemetry::time::now() - Duration::from_secs(600);
        tracker
            .convert(&series.observation(
                MetricKind::F64Sum,
                true,
                observed_at,
                NumberValue::F64(10.0),
            ))
            .unwrap();
        assert_eq!(tracker.series_count(), 1);

        // Liberal buffer over the sweep period to absorb CI slowness.
        thread::sleep(max_stale * 5);
        assert_eq!(tracker.series_count(), 0);

        tracker.shutdown().expect("first shutdown succeeds");
    }

    #[test]
    fn shutdown_is_an_error_when_repeated() {
        let tracker = DeltaTracker::new(Duration::from_millis(10));
        tracker.shutdown().expect("first shutdown succeeds");
        assert!(matches!(tracker.shutdown(), Err(Error::AlreadyShutdown)));
    }

    #[test]
    fn disabled_expiry_never_evicts() {
        let tracker = DeltaTracker::new(Duration::ZERO);
        let series = SeriesFixture::new("200");

        tracker
            .convert(&series.observation(MetricKind::F64Sum, true, ts(100), NumberValue::F64(10.0)))
            .unwrap();

        // No reaper runs; only an explicit sweep could evict, and none is
        // scheduled.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(tracker.series_count(), 1);
        tracker.shutdown().expect("shutdown without a reaper succeeds");
    }
}
