#![deny(missing_docs)]
//! Metrics for the ntuple page storage layer.
//!
//! Every page sink and page source owns an [`NTupleMetrics`] registry. Registries form a tree:
//! a storage can [observe](NTupleMetrics::observe) the registries of the components it drives
//! (a page source observing its cluster pool, a friends source observing its members) so that a
//! single walk reports everything.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use witchcraft_metrics::{MetricRegistry, Metrics, MetricsIter};

// re-export exposed metric types
pub use witchcraft_metrics::{Counter, Histogram, Metric, MetricId, Timer};

/// A metric registry for the counters and timers of a page storage.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Default, Clone)]
pub struct NTupleMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    registry: MetricRegistry,
    default_tags: DefaultTags,
    children: RwLock<Vec<NTupleMetrics>>,
}

/// Default tags for metrics used in [`NTupleMetrics`].
#[derive(Default, Clone)]
pub struct DefaultTags(BTreeMap<Cow<'static, str>, Cow<'static, str>>);

impl<K, V> From<&[(K, V)]> for DefaultTags
where
    K: Clone + Into<Cow<'static, str>>,
    V: Clone + Into<Cow<'static, str>>,
{
    fn from(pairs: &[(K, V)]) -> Self {
        DefaultTags(
            pairs
                .iter()
                .map(|(k, v)| (k.clone().into(), v.clone().into()))
                .collect(),
        )
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for DefaultTags
where
    K: Into<Cow<'static, str>>,
    V: Into<Cow<'static, str>>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        DefaultTags(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl NTupleMetrics {
    /// Create a new [`NTupleMetrics`] instance.
    pub fn new(registry: MetricRegistry, default_tags: impl Into<DefaultTags>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                default_tags: default_tags.into(),
                children: RwLock::default(),
            }),
        }
    }

    /// Create an empty metric registry with default tags.
    pub fn default_with_tags(default_tags: impl Into<DefaultTags>) -> Self {
        Self::new(MetricRegistry::default(), default_tags)
    }

    /// Create an empty registry whose tags extend this one's, and observe it as a child.
    pub fn child_with_tags(&self, tags: impl Into<DefaultTags>) -> Self {
        let mut merged = self.inner.default_tags.clone();
        merged.0.extend(tags.into().0);
        let child = Self::default_with_tags(merged);
        self.observe(child.clone());
        child
    }

    /// Attach another registry so that its metrics are reported together with this one's.
    pub fn observe(&self, child: NTupleMetrics) {
        self.inner.children.write().push(child);
    }

    /// Returns the counter with the specified ID, creating a default instance if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a counter.
    pub fn counter<T>(&self, id: T) -> Arc<Counter>
    where
        T: Into<MetricId>,
    {
        self.inner.registry.counter(id)
    }

    /// Returns the histogram with the specified ID, creating a default instance if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a histogram.
    pub fn histogram<T>(&self, id: T) -> Arc<Histogram>
    where
        T: Into<MetricId>,
    {
        self.inner.registry.histogram(id)
    }

    /// Returns the timer with the specified ID, creating a default instance if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a timer.
    pub fn timer<T>(&self, id: T) -> Arc<Timer>
    where
        T: Into<MetricId>,
    {
        self.inner.registry.timer(id)
    }

    /// Returns a snapshot of the metrics in this registry, excluding observed children.
    ///
    /// Modifications to the registry after this method is called will not affect the state of the returned `MetricsSnapshot`.
    pub fn metrics(&self) -> MetricsSnapshot<'_> {
        MetricsSnapshot {
            snapshot: self.inner.registry.metrics(),
            default_tags: &self.inner.default_tags,
        }
    }

    /// Visit every metric of this registry and, depth first, of all observed children.
    pub fn for_each_metric<F>(&self, mut f: F)
    where
        F: FnMut(MetricId, &Metric),
    {
        self.visit(&mut f);
    }

    fn visit(&self, f: &mut dyn FnMut(MetricId, &Metric)) {
        let snapshot = self.metrics();
        for (id, metric) in snapshot.iter() {
            f(id, metric);
        }
        for child in self.inner.children.read().iter() {
            child.visit(f);
        }
    }
}

/// A snapshot of the metrics in a registry with default tags.
pub struct MetricsSnapshot<'a> {
    snapshot: Metrics,
    default_tags: &'a DefaultTags,
}

impl MetricsSnapshot<'_> {
    /// Create an iterator over the metrics snapshot.
    pub fn iter(&self) -> NTupleMetricsIter<'_> {
        NTupleMetricsIter {
            iter: self.snapshot.iter(),
            default_tags: self.default_tags,
        }
    }
}

/// Metrics Iterator that applies the default tags to each metric in the inner iterator.
pub struct NTupleMetricsIter<'a> {
    iter: MetricsIter<'a>,
    default_tags: &'a DefaultTags,
}

impl<'a> Iterator for NTupleMetricsIter<'a> {
    type Item = (MetricId, &'a Metric);

    #[inline]
    fn next(&mut self) -> Option<(MetricId, &'a Metric)> {
        self.iter.next().map(|(k, v)| {
            let mut metric_id = k.clone();
            for (tag_key, tag_value) in self.default_tags.0.iter() {
                metric_id = metric_id.with_tag(tag_key.clone(), tag_value.clone())
            }

            (metric_id, v)
        })
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

/// Run `f` and record its wall-clock duration in `timer`.
pub fn timed<R>(timer: &Timer, f: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let result = f();
    timer.update(start.elapsed());
    result
}

/// Convert a byte count to the `i64` used by counters, saturating on overflow.
#[inline]
pub fn as_count(n: impl TryInto<i64>) -> i64 {
    n.try_into().unwrap_or(i64::MAX)
}

/// Elapsed time helper for timers that span more than one scope.
pub struct Stopwatch {
    timer: Arc<Timer>,
    start: Instant,
}

impl Stopwatch {
    /// Start measuring for `timer`.
    pub fn start(timer: Arc<Timer>) -> Self {
        Self {
            timer,
            start: Instant::now(),
        }
    }

    /// Stop and record, returning the elapsed duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        self.timer.update(elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_between_clones() {
        let metrics = NTupleMetrics::default();
        let clone = metrics.clone();
        metrics.counter("n_read").inc();
        clone.counter("n_read").add(2);
        assert_eq!(metrics.counter("n_read").count(), 3);
    }

    #[test]
    fn children_are_visited_with_tags() {
        let parent = NTupleMetrics::default_with_tags([("storage", "source")]);
        let child = parent.child_with_tags([("component", "cluster_pool")]);
        parent.counter("n_read").inc();
        child.counter("n_cluster_loaded").add(4);

        let mut seen = Vec::new();
        parent.for_each_metric(|id, metric| {
            if let Metric::Counter(counter) = metric {
                seen.push((id.name().to_string(), counter.count()));
            }
        });
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("n_cluster_loaded".to_string(), 4),
                ("n_read".to_string(), 1),
            ]
        );
    }

    #[test]
    fn timed_records_one_sample() {
        let metrics = NTupleMetrics::default();
        let timer = metrics.timer("time_wall_read");
        let value = timed(&timer, || 7);
        assert_eq!(value, 7);
        assert_eq!(timer.count(), 1);
    }
}
