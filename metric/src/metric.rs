use super::*;
use std::sync::Arc;

/// A type that reports a single [`Observation`] and hands out recorders
/// that mutate it.
pub trait MetricObserver: std::fmt::Debug + Default + Clone + Send + Sync + 'static {
    /// The type used to modify this observer's value.
    ///
    /// Both counters and gauges are cheaply cloneable and act as their own
    /// recorder.
    type Recorder;

    /// The kind of observation this observer reports.
    fn kind() -> MetricKind;

    /// Return a recorder that mutates this observer's value.
    fn recorder(&self) -> Self::Recorder;

    /// Return the current value of this observer.
    fn observe(&self) -> Observation;
}

/// A [`Metric`] maintains one [`MetricObserver`] per unique set of
/// [`Attributes`], and reports them all under a single instrument name.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    shared: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

// Not derived: a derived Clone would require `T: Clone` even though only
// the Arc is cloned.
impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    pub(crate) fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            shared: Default::default(),
        }
    }

    /// Returns a recorder for the observer associated with `attributes`,
    /// creating the observer if it does not yet exist.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T::Recorder {
        self.observer(attributes.into()).recorder()
    }

    /// Returns the observer for `attributes`, if one has been created.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.shared.lock().get(attributes).cloned()
    }

    fn observer(&self, attributes: Attributes) -> T {
        self.shared.lock().entry(attributes).or_default().clone()
    }
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn report(&self, reporter: &mut dyn Reporter) {
        reporter.start_metric(self.name, self.description, T::kind());
        // BTreeMap iteration yields attribute sets in alphabetical order.
        for (attributes, observer) in self.shared.lock().iter() {
            reporter.report_observation(attributes, observer.observe())
        }
        reporter.finish_metric();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
