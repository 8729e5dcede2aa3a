//! End-to-end tests driving the netstorage layer against in-process
//! fake storage nodes speaking the real wire protocol.

use data_types::{Deadline, Label, MetricName, SearchQuery, TagFilter, Tenant, TimeRange};
use metric::{Metric, MetricObserver, Observation, RawReporter, U64Counter};
use netstorage::test_util::FakeStorageNode;
use netstorage::{Error, StorageCluster};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn deadline() -> Deadline {
    Deadline::new(Duration::from_secs(10))
}

fn tenant() -> Tenant {
    Tenant::new(1, 0)
}

fn cluster(nodes: &[&FakeStorageNode]) -> (Arc<StorageCluster>, Arc<metric::Registry>) {
    let registry = Arc::new(metric::Registry::new());
    let cluster = StorageCluster::new(
        nodes.iter().map(|n| n.addr()),
        None,
        &registry,
    )
    .unwrap();
    (Arc::new(cluster), registry)
}

/// Builds the canonical label set for a series: metric name first, then
/// the remaining labels sorted by name.
fn series_labels(name: &str, labels: &[(&str, &str)]) -> Vec<Label> {
    let mut out = vec![Label::new("", name)];
    out.extend(labels.iter().map(|(n, v)| Label::new(*n, *v)));
    data_types::canonicalize_labels(&mut out);
    out
}

fn name_selector(name: &str) -> Vec<TagFilter> {
    vec![TagFilter {
        key: "".to_owned(),
        value: name.to_owned(),
        is_negative: false,
        is_regexp: false,
    }]
}

async fn write_rows(
    cluster: &Arc<StorageCluster>,
    name: &str,
    labels: &[(&str, &str)],
    rows: &[(i64, f64)],
) {
    let mut ctx = cluster.insert_ctx();
    for (timestamp, value) in rows {
        ctx.reset();
        for label in series_labels(name, labels) {
            ctx.add_label(label.name, label.value);
        }
        ctx.write_data_point(tenant(), *timestamp, *value)
            .await
            .unwrap();
        ctx.flush_bufs().await.unwrap();
    }
}

/// Runs a search and collects the merged series as
/// `(metric_name, timestamps, values)` triples sorted by name.
async fn search(
    cluster: &Arc<StorageCluster>,
    filters: Vec<TagFilter>,
    range: TimeRange,
) -> (Vec<(String, Vec<i64>, Vec<f64>)>, bool) {
    let sq = SearchQuery::new(tenant(), range, filters);
    let (results, is_partial) = cluster
        .process_search_query(&sq, deadline())
        .await
        .unwrap();

    let collected = Mutex::new(Vec::new());
    results
        .run_parallel(|series| {
            let name = series
                .metric_name
                .labels
                .iter()
                .find(|l| l.name.is_empty())
                .map(|l| l.value.clone())
                .unwrap_or_default();
            collected
                .lock()
                .push((name, series.timestamps.clone(), series.values.clone()));
        })
        .await
        .unwrap();

    let mut collected = collected.into_inner();
    collected.sort_by(|a, b| a.0.cmp(&b.0));
    (collected, is_partial)
}

fn counter_value(registry: &metric::Registry, name: &'static str) -> u64 {
    let mut reporter = RawReporter::default();
    registry.report(&mut reporter);
    match reporter.metric(name).and_then(|set| set.observation(&[]).cloned()) {
        Some(Observation::U64Counter(v)) => v,
        _ => 0,
    }
}

#[tokio::test]
async fn single_shard_write_then_query() {
    let node = FakeStorageNode::start().await;
    let (cluster, _registry) = cluster(&[&node]);

    write_rows(&cluster, "m", &[], &[(1000, 1.5), (2000, 2.5)]).await;
    assert_eq!(node.row_count(), 2);

    let (series, is_partial) = search(
        &cluster,
        name_selector("m"),
        TimeRange::new(1000, 2000),
    )
    .await;

    assert!(!is_partial);
    assert_eq!(
        series,
        vec![("m".to_owned(), vec![1000, 2000], vec![1.5, 2.5])]
    );
}

#[tokio::test]
async fn two_shard_fanout_and_dedupe() {
    let node_a = FakeStorageNode::start().await;
    let node_b = FakeStorageNode::start().await;
    let (cluster, _registry) = cluster(&[&node_a, &node_b]);

    for name in ["a", "b", "c", "d", "e"] {
        write_rows(&cluster, name, &[], &[(1000, 1.0)]).await;
    }
    // The router spread the series deterministically over both shards.
    assert_eq!(node_a.row_count() + node_b.row_count(), 5);

    let (labels, is_partial) = cluster.get_labels(tenant(), deadline()).await.unwrap();
    assert!(!is_partial);
    assert_eq!(labels, vec!["__name__".to_owned()]);

    let (values, is_partial) = cluster
        .get_label_values(tenant(), "__name__", deadline())
        .await
        .unwrap();
    assert!(!is_partial);
    assert_eq!(values, vec!["a", "b", "c", "d", "e"]);

    let (count, is_partial) = cluster.get_series_count(tenant(), deadline()).await.unwrap();
    assert!(!is_partial);
    assert_eq!(count, 5);
}

#[tokio::test]
async fn router_is_deterministic_per_series() {
    let node_a = FakeStorageNode::start().await;
    let node_b = FakeStorageNode::start().await;
    let (cluster, _registry) = cluster(&[&node_a, &node_b]);

    write_rows(
        &cluster,
        "m",
        &[("job", "api")],
        &[(1000, 1.0), (2000, 2.0), (3000, 3.0)],
    )
    .await;

    // Identical label sets land on exactly one shard.
    let (a, b) = (node_a.row_count(), node_b.row_count());
    assert_eq!(a + b, 3);
    assert!(a == 0 || b == 0, "series split across shards: {a} vs {b}");
}

#[tokio::test]
async fn merge_orders_blocks_from_two_shards() {
    let node_a = FakeStorageNode::start().await;
    let node_b = FakeStorageNode::start().await;
    let (cluster, _registry) = cluster(&[&node_a, &node_b]);

    // Place interleaved blocks of one series on both shards by hand;
    // the router would never do this, the merge must cope anyway.
    let mn = MetricName::new(tenant(), series_labels("m", &[]));
    for (ts, v) in [(10, 1.0), (20, 2.0), (30, 3.0)] {
        node_a.insert_row(&mn, ts, v);
    }
    for (ts, v) in [(15, 1.5), (25, 2.5)] {
        node_b.insert_row(&mn, ts, v);
    }

    let (series, is_partial) = search(&cluster, name_selector("m"), TimeRange::new(0, 100)).await;
    assert!(!is_partial);
    assert_eq!(
        series,
        vec![(
            "m".to_owned(),
            vec![10, 15, 20, 25, 30],
            vec![1.0, 1.5, 2.0, 2.5, 3.0]
        )]
    );
}

#[tokio::test]
async fn multi_block_series_merges_chronologically() {
    let node = FakeStorageNode::start().await;
    // Tiny blocks force the k-way merge over many blocks per series.
    node.set_block_rows(3);
    let (cluster, _registry) = cluster(&[&node]);

    let rows: Vec<(i64, f64)> = (0..100).map(|i| (i * 10, i as f64)).collect();
    write_rows(&cluster, "m", &[], &rows).await;

    let (series, _) = search(&cluster, name_selector("m"), TimeRange::new(0, 10_000)).await;
    let (_, timestamps, values) = &series[0];
    assert_eq!(timestamps.len(), 100);
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(values[10], 10.0);
}

#[tokio::test]
async fn time_range_clipping_counts_skipped_rows() {
    let node = FakeStorageNode::start().await;
    let (cluster, registry) = cluster(&[&node]);

    write_rows(&cluster, "m", &[], &[(1000, 1.0), (2000, 2.0), (3000, 3.0)]).await;

    let (series, _) = search(&cluster, name_selector("m"), TimeRange::new(1500, 2500)).await;
    assert_eq!(series, vec![("m".to_owned(), vec![2000], vec![2.0])]);
    assert_eq!(counter_value(&registry, "metric_rows_skipped"), 2);
}

#[tokio::test]
async fn partial_search_when_one_shard_is_down() {
    let node_a = FakeStorageNode::start().await;
    let node_b = FakeStorageNode::start().await;
    let (cluster, registry) = cluster(&[&node_a, &node_b]);

    // Ensure both shards hold data, then kill one.
    let mn_a = MetricName::new(tenant(), series_labels("alpha", &[]));
    let mn_b = MetricName::new(tenant(), series_labels("beta", &[]));
    node_a.insert_row(&mn_a, 1000, 1.0);
    node_b.insert_row(&mn_b, 1000, 2.0);
    node_b.shutdown();

    let (series, is_partial) = search(
        &cluster,
        vec![],
        TimeRange::new(0, 10_000),
    )
    .await;

    assert!(is_partial);
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].0, "alpha");
    assert_eq!(counter_value(&registry, "partial_search_results"), 1);
}

#[tokio::test]
async fn all_shards_down_is_a_hard_error() {
    let node_a = FakeStorageNode::start().await;
    let node_b = FakeStorageNode::start().await;
    let (cluster, registry) = cluster(&[&node_a, &node_b]);
    node_a.shutdown();
    node_b.shutdown();

    let err = cluster.get_labels(tenant(), deadline()).await.unwrap_err();
    assert!(matches!(err, Error::Rpc { .. }), "unexpected error: {err}");

    let sq = SearchQuery::new(tenant(), TimeRange::new(0, 1000), vec![]);
    cluster
        .process_search_query(&sq, deadline())
        .await
        .unwrap_err();

    // Hard failures are not partial results.
    assert_eq!(counter_value(&registry, "partial_labels_results"), 0);
    assert_eq!(counter_value(&registry, "partial_search_results"), 0);
}

#[tokio::test]
async fn remote_error_is_surfaced_after_retry() {
    let node = FakeStorageNode::start().await;
    node.set_remote_error("index corrupted");
    let (cluster, _registry) = cluster(&[&node]);

    let err = cluster.get_labels(tenant(), deadline()).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("remote error"), "unexpected error: {msg}");
    assert!(msg.contains("index corrupted"), "unexpected error: {msg}");
}

#[tokio::test]
async fn transient_connection_reset_is_retried() {
    let node = FakeStorageNode::start().await;
    let (cluster, registry) = cluster(&[&node]);

    write_rows(&cluster, "m", &[], &[(1000, 1.5)]).await;

    // The first search attempt dies on a reset connection; the one-shot
    // retry must return the full result, not a partial one.
    node.set_reset_once();
    let (series, is_partial) = search(&cluster, name_selector("m"), TimeRange::new(0, 10_000)).await;
    assert!(!is_partial);
    assert_eq!(series, vec![("m".to_owned(), vec![1000], vec![1.5])]);
    assert_eq!(counter_value(&registry, "partial_search_results"), 0);
}

#[tokio::test]
async fn per_shard_gate_rejects_excess_queries() {
    let node = FakeStorageNode::start().await;
    node.set_response_delay(Duration::from_millis(300));

    let registry = Arc::new(metric::Registry::new());
    let cluster = Arc::new(
        StorageCluster::with_node_concurrency([node.addr()], None, &registry, 1).unwrap(),
    );

    let slow = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.get_labels(tenant(), deadline()).await })
    };
    // Give the first query time to occupy the node's only slot.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = cluster.get_labels(tenant(), deadline()).await.unwrap_err();
    assert!(
        err.to_string()
            .contains("too many concurrent queries (more than 1)"),
        "unexpected error: {err}"
    );

    slow.await.unwrap().unwrap();
}

#[tokio::test]
async fn expired_deadline_fails_at_first_io() {
    let node = FakeStorageNode::start().await;
    let (cluster, _registry) = cluster(&[&node]);

    let past = Deadline::new(Duration::ZERO);
    let err = cluster.get_labels(tenant(), past).await.unwrap_err();
    match err {
        Error::Rpc { source, .. } => assert!(!source.is_remote()),
        other => panic!("expected a transport error, got {other}"),
    }
}

#[tokio::test]
async fn label_entries_merge_and_sort() {
    let node_a = FakeStorageNode::start().await;
    let node_b = FakeStorageNode::start().await;
    let (cluster, _registry) = cluster(&[&node_a, &node_b]);

    let mn_a = MetricName::new(tenant(), series_labels("reqs", &[("job", "api")]));
    let mn_b = MetricName::new(tenant(), series_labels("reqs", &[("job", "web")]));
    node_a.insert_row(&mn_a, 1000, 1.0);
    node_b.insert_row(&mn_b, 1000, 1.0);

    let (entries, is_partial) = cluster.get_label_entries(tenant(), deadline()).await.unwrap();
    assert!(!is_partial);

    // Sorted by (value count, key): one metric name before two jobs.
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].key, "__name__");
    assert_eq!(entries[0].values, vec!["reqs"]);
    assert_eq!(entries[1].key, "job");
    assert_eq!(entries[1].values, vec!["api", "web"]);
}

#[tokio::test]
async fn delete_series_is_idempotent() {
    let node_a = FakeStorageNode::start().await;
    let node_b = FakeStorageNode::start().await;
    let (cluster, _registry) = cluster(&[&node_a, &node_b]);

    for name in ["a", "b", "c"] {
        write_rows(&cluster, name, &[], &[(1000, 1.0)]).await;
    }

    let sq = SearchQuery::new(tenant(), TimeRange::new(0, i64::MAX), name_selector("a"));
    let deleted = cluster.delete_series(&sq, deadline()).await.unwrap();
    assert_eq!(deleted, 1);

    // Applying the same delete twice has the same logical effect.
    let deleted = cluster.delete_series(&sq, deadline()).await.unwrap();
    assert_eq!(deleted, 0);

    let (values, _) = cluster
        .get_label_values(tenant(), "__name__", deadline())
        .await
        .unwrap();
    assert_eq!(values, vec!["b", "c"]);
}

#[tokio::test]
async fn buffer_at_cap_flushes_before_the_next_row() {
    let node = FakeStorageNode::start().await;
    let (cluster, _registry) = cluster(&[&node]);

    // Rows of ~32 KiB reach the 1 MiB buffer cap after ~32 rows, which
    // must trigger a flush without any explicit flush_bufs call.
    let big = "x".repeat(32 * 1024);
    let mut ctx = cluster.insert_ctx();
    for i in 0..64i64 {
        ctx.labels.clear();
        ctx.add_label("", "bulk");
        ctx.add_label("payload", &big);
        ctx.write_data_point(tenant(), i, i as f64).await.unwrap();
    }
    assert!(
        node.row_count() > 0,
        "no rows delivered before the explicit flush"
    );

    ctx.flush_bufs().await.unwrap();
    assert_eq!(node.row_count(), 64);

    // After a successful flush every buffer is empty: flushing again
    // pushes nothing.
    let before = node.row_count();
    ctx.flush_bufs().await.unwrap();
    assert_eq!(node.row_count(), before);
}

#[tokio::test]
async fn zero_shards_fails_at_startup() {
    let registry = metric::Registry::new();
    let err = StorageCluster::new(std::iter::empty(), None, &registry).unwrap_err();
    assert!(matches!(err, Error::NoStorageNodes));
}

#[tokio::test]
async fn concurrency_gauge_tracks_in_flight_queries() {
    let node = FakeStorageNode::start().await;
    node.set_response_delay(Duration::from_millis(200));
    let (cluster, registry) = cluster(&[&node]);

    let in_flight = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.get_labels(tenant(), deadline()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let gauge = registry
        .get_instrument::<Metric<metric::U64Gauge>>("storage_node_concurrent_queries")
        .unwrap();
    let attrs = metric::Attributes::from([("addr", node.addr().into())]);
    let observer = gauge.get_observer(&attrs).unwrap();
    assert_eq!(observer.observe(), Observation::U64Gauge(1));

    in_flight.await.unwrap().unwrap();
    assert_eq!(observer.observe(), Observation::U64Gauge(0));
}

#[tokio::test]
async fn request_counters_are_per_verb_and_shard() {
    let node = FakeStorageNode::start().await;
    let (cluster, registry) = cluster(&[&node]);

    cluster.get_labels(tenant(), deadline()).await.unwrap();
    cluster.get_labels(tenant(), deadline()).await.unwrap();
    cluster.get_series_count(tenant(), deadline()).await.unwrap();

    let requests = registry
        .get_instrument::<Metric<U64Counter>>("storage_node_requests")
        .unwrap();
    let addr = node.addr();
    let labels_attrs =
        metric::Attributes::from([("addr", addr.clone().into()), ("verb", "labels".into())]);
    let count_attrs =
        metric::Attributes::from([("addr", addr.into()), ("verb", "series_count".into())]);

    assert_eq!(
        requests.get_observer(&labels_attrs).unwrap().observe(),
        Observation::U64Counter(2)
    );
    assert_eq!(
        requests.get_observer(&count_attrs).unwrap().observe(),
        Observation::U64Counter(1)
    );
}
