//! Metric abstraction for the selectd workspace.
//!
//! The design goals, in order:
//!
//! 1. Minimal dependencies to instrument a crate
//! 2. Metric recording decoupled from metric export
//! 3. Metric names are `&'static str` and greppable
//! 4. Attribute manipulation can be amortised over many records
//! 5. Instrumentation is testable without a full exposition dump
//!
//! A [`Registry`] stores [`Instrument`]s by name. An `Instrument` knows how
//! to write its observations to a [`Reporter`]; [`Registry::report`] walks
//! all instruments in name order. [`RawReporter`] buffers observations and
//! is what tests assert against; the HTTP layer renders the same stream as
//! Prometheus text exposition.
//!
//! Recording happens on the concrete types: [`Metric<T>`] hands out one
//! `T` per unique [`Attributes`] set, and callers use the member functions
//! of [`U64Counter`] / [`U64Gauge`] directly:
//!
//! ```
//! use metric::{Registry, Metric, U64Counter};
//!
//! let registry = Registry::new();
//! let requests: Metric<U64Counter> =
//!     registry.register_metric("requests", "total number of requests");
//!
//! // The recorder can be cached to avoid repeated attribute lookups.
//! let recorder = requests.recorder(&[("verb", "search")]);
//! recorder.inc(1);
//! ```

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

mod counter;
mod gauge;
mod metric;

pub use crate::metric::*;
pub use counter::*;
pub use gauge::*;

/// A map of metric names to [`Instrument`]s.
///
/// Instruments are registered on first use and shared between all callers
/// that register the same name.
#[derive(Debug, Default)]
pub struct Registry {
    /// A `BTreeMap` keeps reports in a consistent (alphabetical) order.
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Instrument>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) the [`Metric`] with the provided name.
    ///
    /// # Panics
    ///
    /// Panics if `name` was already registered with a different instrument
    /// type, or if `name` is not `[0-9a-z_]+`.
    pub fn register_metric<T>(&self, name: &'static str, description: &'static str) -> Metric<T>
    where
        T: MetricObserver,
    {
        assert_legal_key(name);

        let mut instruments = self.instruments.lock();
        match instruments.entry(name) {
            Entry::Occupied(o) => match o.get().as_any().downcast_ref::<Metric<T>>() {
                Some(metric) => metric.clone(),
                None => panic!("instrument {name} registered with two different types"),
            },
            Entry::Vacant(v) => {
                let metric = Metric::new(name, description);
                v.insert(Box::new(metric.clone()));
                metric
            }
        }
    }

    /// Returns the already-registered instrument with this name, if any.
    ///
    /// Primarily useful for tests.
    pub fn get_instrument<I: Instrument + Clone + 'static>(&self, name: &'static str) -> Option<I> {
        let instruments = self.instruments.lock();
        instruments
            .get(name)
            .map(|instrument| match instrument.as_any().downcast_ref::<I>() {
                Some(metric) => metric.clone(),
                None => panic!("instrument {name} registered with two different types"),
            })
    }

    /// Record the current state of every registered metric to `reporter`,
    /// in alphabetical name order.
    pub fn report(&self, reporter: &mut dyn Reporter) {
        let instruments = self.instruments.lock();
        for instrument in instruments.values() {
            instrument.report(reporter)
        }
    }
}

/// A type that knows how to write its observations to a [`Reporter`].
pub trait Instrument: std::fmt::Debug + Send + Sync {
    /// Record the current state of this instrument.
    ///
    /// Calls `start_metric` once, `report_observation` once per attribute
    /// set in alphabetical order, then `finish_metric`.
    fn report(&self, reporter: &mut dyn Reporter);

    /// Returns `self` as [`Any`] so callers can downcast to the concrete
    /// instrument type.
    fn as_any(&self) -> &dyn Any;
}

/// Sink for the observations of a [`Registry`].
pub trait Reporter {
    /// Start recording the observations of a single metric.
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    );

    /// Record one observation for the metric started by `start_metric`.
    fn report_observation(&mut self, attributes: &Attributes, observation: Observation);

    /// Finish the metric started by `start_metric`.
    fn finish_metric(&mut self);
}

/// The type of observation an instrument reports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MetricKind {
    U64Counter,
    U64Gauge,
}

/// A single recorded value.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Observation {
    U64Counter(u64),
    U64Gauge(u64),
}

/// The observations of a single metric, buffered by [`RawReporter`].
#[derive(Debug, Clone)]
pub struct ObservationSet {
    pub metric_name: &'static str,
    pub description: &'static str,
    pub kind: MetricKind,
    pub observations: Vec<(Attributes, Observation)>,
}

impl ObservationSet {
    /// Returns the observation for the given attributes, if any.
    pub fn observation(&self, attributes: impl Into<Attributes>) -> Option<&Observation> {
        let attributes = attributes.into();
        self.observations
            .iter()
            .find_map(|(a, o)| (a == &attributes).then_some(o))
    }
}

/// A [`Reporter`] that buffers the raw observation stream, for tests.
#[derive(Debug, Clone, Default)]
pub struct RawReporter {
    completed: Vec<ObservationSet>,
    in_progress: Option<ObservationSet>,
}

impl Reporter for RawReporter {
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    ) {
        assert!(self.in_progress.is_none(), "metric already in progress");
        self.in_progress = Some(ObservationSet {
            metric_name,
            description,
            kind,
            observations: Default::default(),
        })
    }

    fn report_observation(&mut self, attributes: &Attributes, observation: Observation) {
        let metric = self
            .in_progress
            .as_mut()
            .expect("metric should be in progress");
        metric.observations.push((attributes.clone(), observation))
    }

    fn finish_metric(&mut self) {
        let metric = self
            .in_progress
            .take()
            .expect("metric should be in progress");
        self.completed.push(metric)
    }
}

impl RawReporter {
    /// Returns the buffered [`ObservationSet`] for each reported metric.
    pub fn observations(&self) -> &Vec<ObservationSet> {
        assert!(self.in_progress.is_none(), "metric observation in progress");
        &self.completed
    }

    /// Returns the observation set for the given metric name, if any.
    pub fn metric(&self, metric_name: &str) -> Option<&ObservationSet> {
        self.observations()
            .iter()
            .find(|set| set.metric_name == metric_name)
    }
}

/// A set of key-value pairs with unique keys.
///
/// A [`Metric`] records a separate observation for each unique set.
#[derive(Debug, Clone, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, &'static str, Cow<'static, str>> {
        self.0.iter()
    }

    /// Sets the value of an attribute, replacing any existing value.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        assert_legal_key(key);
        self.0.insert(key, value.into());
    }
}

impl<'a, const N: usize> From<&'a [(&'static str, &'static str); N]> for Attributes {
    fn from(iterator: &'a [(&'static str, &'static str); N]) -> Self {
        Self(
            iterator
                .into_iter()
                .map(|(key, value)| {
                    assert_legal_key(key);
                    (*key, Cow::Borrowed(*value))
                })
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&'static str, Cow<'static, str>); N]> for Attributes {
    fn from(iterator: [(&'static str, Cow<'static, str>); N]) -> Self {
        Self(
            iterator
                .into_iter()
                .map(|(key, value)| {
                    assert_legal_key(key);
                    (key, value)
                })
                .collect(),
        )
    }
}

/// Panics if the provided string doesn't match `[0-9a-z_]+`.
pub fn assert_legal_key(s: &str) {
    assert!(!s.is_empty(), "string must not be empty");
    assert!(
        s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='z' | '_')),
        "string must be [0-9a-z_]+ got: \"{s}\""
    )
}
