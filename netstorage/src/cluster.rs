//! Scatter executor: runs each read verb concurrently across every
//! shard and aggregates the per-shard results.
//!
//! Partial-result policy, applied uniformly to the label/count verbs:
//! if every shard failed the first error is returned; if only some
//! failed, the partial counter is incremented, the first error is
//! logged, and the successful union is returned flagged as partial.
//! Search follows the same shape but deliberately does not log (one
//! line per query would spam a busy select tier).

use crate::merge::{PackedTimeseries, SearchResults};
use crate::node::{StorageNode, MAX_CONCURRENT_QUERIES_PER_STORAGE_NODE};
use crate::spill::{BlockAddr, SpillFile};
use crate::Error;
use data_types::{Deadline, LabelEntry, SearchQuery, Tenant, NAME_LABEL};
use metric::U64Counter;
use observability_deps::tracing::error;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug)]
struct ClusterMetrics {
    partial_labels_results: U64Counter,
    partial_label_values_results: U64Counter,
    partial_label_entries_results: U64Counter,
    partial_series_count_results: U64Counter,
    partial_search_results: U64Counter,
    metric_rows_skipped: U64Counter,
}

impl ClusterMetrics {
    fn new(registry: &metric::Registry) -> Self {
        let partial = |name: &'static str, description: &'static str| {
            registry
                .register_metric::<U64Counter>(name, description)
                .recorder(&[])
        };
        Self {
            partial_labels_results: partial(
                "partial_labels_results",
                "labels responses that are missing data from failed storage nodes",
            ),
            partial_label_values_results: partial(
                "partial_label_values_results",
                "label values responses that are missing data from failed storage nodes",
            ),
            partial_label_entries_results: partial(
                "partial_label_entries_results",
                "label entries responses that are missing data from failed storage nodes",
            ),
            partial_series_count_results: partial(
                "partial_series_count_results",
                "series count responses that are missing data from failed storage nodes",
            ),
            partial_search_results: partial(
                "partial_search_results",
                "search responses that are missing data from failed storage nodes",
            ),
            metric_rows_skipped: partial(
                "metric_rows_skipped",
                "rows dropped because their timestamps fall outside the query time range",
            ),
        }
    }
}

/// The fixed, ordered set of storage shards this process talks to.
///
/// Created once at startup from configuration and never mutated; a
/// shard's index in the list is its permanent routing identity.
#[derive(Debug)]
pub struct StorageCluster {
    nodes: Vec<Arc<StorageNode>>,
    spill_dir: Option<PathBuf>,
    metrics: ClusterMetrics,
}

impl StorageCluster {
    /// Connects the cluster with the default per-node concurrency limit.
    ///
    /// `spill_dir`, when set, hosts the per-query spill files; it should
    /// be cleared of leftovers at startup.
    pub fn new(
        addrs: impl IntoIterator<Item = String>,
        spill_dir: Option<PathBuf>,
        registry: &metric::Registry,
    ) -> Result<Self, Error> {
        Self::with_node_concurrency(
            addrs,
            spill_dir,
            registry,
            MAX_CONCURRENT_QUERIES_PER_STORAGE_NODE,
        )
    }

    /// [`new`](Self::new) with an explicit per-node in-flight query cap.
    pub fn with_node_concurrency(
        addrs: impl IntoIterator<Item = String>,
        spill_dir: Option<PathBuf>,
        registry: &metric::Registry,
        node_concurrency: usize,
    ) -> Result<Self, Error> {
        let nodes: Vec<_> = addrs
            .into_iter()
            .map(|addr| Arc::new(StorageNode::new(addr, node_concurrency, registry)))
            .collect();
        if nodes.is_empty() {
            return Err(Error::NoStorageNodes);
        }

        Ok(Self {
            nodes,
            spill_dir,
            metrics: ClusterMetrics::new(registry),
        })
    }

    pub fn nodes(&self) -> &[Arc<StorageNode>] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Gracefully stops the cluster.
    ///
    /// In-flight RPCs are not cancelled: every RPC already carries a
    /// deadline that terminates it at the socket, so shutdown simply
    /// stops handing out new work.
    pub fn stop(&self) {}

    /// Deletes all series matching `sq` on every shard, returning the
    /// total number of deleted series.
    ///
    /// Deletion is idempotent on the storage side; re-running the same
    /// query is safe and the second pass may report zero deletions.
    pub async fn delete_series(&self, sq: &SearchQuery, deadline: Deadline) -> Result<u64, Error> {
        let mut request_data = Vec::new();
        sq.marshal(&mut request_data)?;
        let request_data = Arc::new(request_data);

        let results = self
            .scatter(|node| {
                let request_data = Arc::clone(&request_data);
                async move { node.delete_metrics(&request_data, deadline).await }
            })
            .await;

        let mut deleted_total = 0u64;
        let mut first_err = None;
        for res in results {
            match res {
                Ok(n) => deleted_total += n,
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(deleted_total),
        }
    }

    /// Returns the sorted, deduplicated union of label names across all
    /// shards, plus the partial-result flag.
    pub async fn get_labels(
        &self,
        tenant: Tenant,
        deadline: Deadline,
    ) -> Result<(Vec<String>, bool), Error> {
        let results = self
            .scatter(|node| async move { node.get_labels(tenant, deadline).await })
            .await;

        let (mut labels, is_partial) = self.aggregate_union(
            results,
            &self.metrics.partial_labels_results,
            "fetching labels",
        )?;

        // Prometheus exposes the metric name under "__name__".
        for label in &mut labels {
            if label.is_empty() {
                *label = NAME_LABEL.to_owned();
            }
        }
        labels.sort();
        labels.dedup();
        Ok((labels, is_partial))
    }

    /// Returns the sorted, deduplicated union of values for `label_name`
    /// across all shards, plus the partial-result flag.
    pub async fn get_label_values(
        &self,
        tenant: Tenant,
        label_name: &str,
        deadline: Deadline,
    ) -> Result<(Vec<String>, bool), Error> {
        // On the wire the metric name is the empty label.
        let label_name = if label_name == NAME_LABEL {
            ""
        } else {
            label_name
        };
        let label_name: Arc<str> = label_name.into();

        let results = self
            .scatter(|node| {
                let label_name = Arc::clone(&label_name);
                async move { node.get_label_values(tenant, &label_name, deadline).await }
            })
            .await;

        let (mut values, is_partial) = self.aggregate_union(
            results,
            &self.metrics.partial_label_values_results,
            "fetching label values",
        )?;
        values.sort();
        values.dedup();
        Ok((values, is_partial))
    }

    /// Returns every label entry (name plus all its values) across all
    /// shards, sorted by (value count, name), plus the partial flag.
    pub async fn get_label_entries(
        &self,
        tenant: Tenant,
        deadline: Deadline,
    ) -> Result<(Vec<LabelEntry>, bool), Error> {
        let results = self
            .scatter(|node| async move { node.get_label_entries(tenant, deadline).await })
            .await;

        let (entries, is_partial) = self.aggregate_union(
            results,
            &self.metrics.partial_label_entries_results,
            "fetching label entries",
        )?;

        // Merge per-key value lists from the different shards.
        let mut merged: HashMap<String, Vec<String>> = HashMap::new();
        for entry in entries {
            let key = if entry.key.is_empty() {
                NAME_LABEL.to_owned()
            } else {
                entry.key
            };
            merged.entry(key).or_default().extend(entry.values);
        }

        let mut entries: Vec<LabelEntry> = merged
            .into_iter()
            .map(|(key, mut values)| {
                values.sort();
                values.dedup();
                LabelEntry { key, values }
            })
            .collect();
        entries.sort_by(|a, b| {
            a.values
                .len()
                .cmp(&b.values.len())
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok((entries, is_partial))
    }

    /// Returns the total number of unique series across all shards,
    /// plus the partial-result flag.
    pub async fn get_series_count(
        &self,
        tenant: Tenant,
        deadline: Deadline,
    ) -> Result<(u64, bool), Error> {
        let results = self
            .scatter(|node| async move { node.get_series_count(tenant, deadline).await })
            .await;

        let mut total = 0u64;
        let mut first_err = None;
        let mut failed = 0;
        for res in results {
            match res {
                Ok(n) => total += n,
                Err(e) => {
                    failed += 1;
                    first_err = first_err.or(Some(e));
                }
            }
        }

        let is_partial = match first_err {
            Some(err) if failed == self.nodes.len() => return Err(err),
            Some(err) => {
                self.metrics.partial_series_count_results.inc(1);
                error!(%err, "certain storage nodes are unhealthy when fetching series count");
                true
            }
            None => false,
        };
        Ok((total, is_partial))
    }

    /// Fans `sq` out to every shard, spilling returned blocks and
    /// indexing them by metric name.
    ///
    /// Returns the finalized [`SearchResults`] plus the partial flag.
    pub async fn process_search_query(
        &self,
        sq: &SearchQuery,
        deadline: Deadline,
    ) -> Result<(SearchResults, bool), Error> {
        let mut request_data = Vec::new();
        sq.marshal(&mut request_data)?;
        let request_data = Arc::new(request_data);

        let results = self
            .scatter(|node| {
                let request_data = Arc::clone(&request_data);
                async move { node.process_search_query(&request_data, deadline).await }
            })
            .await;

        let mut spill = SpillFile::new(self.spill_dir.clone());
        let mut by_name: HashMap<Vec<u8>, Vec<BlockAddr>> = HashMap::new();
        let mut payload = Vec::new();
        let mut first_err = None;
        let mut failed = 0;

        for res in results {
            match res {
                Ok(blocks) => {
                    for mb in blocks {
                        payload.clear();
                        mb.block.marshal(&mut payload);
                        match spill.write_block(&payload) {
                            Ok(addr) => by_name.entry(mb.metric_name_raw).or_default().push(addr),
                            Err(source) => {
                                // A spill write failure voids the rest of this
                                // shard's contribution; the other shards' data
                                // is still usable.
                                failed += 1;
                                first_err = first_err.or(Some(Error::SpillWrite { source }));
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    failed += 1;
                    first_err = first_err.or(Some(e));
                }
            }
        }

        let is_partial = match first_err {
            Some(err) if failed >= self.nodes.len() => return Err(err),
            Some(_) => {
                // Not logged: search runs on the hot path and one line per
                // degraded query would flood the logs.
                self.metrics.partial_search_results.inc(1);
                true
            }
            None => false,
        };

        let spill = spill
            .finalize()
            .map_err(|source| Error::SpillFinalize { source })?;
        let packed = by_name
            .into_iter()
            .map(|(metric_name_raw, addrs)| PackedTimeseries {
                metric_name_raw,
                addrs,
            })
            .collect();

        Ok((
            SearchResults::new(
                sq.time_range,
                deadline,
                spill,
                packed,
                self.metrics.metric_rows_skipped.clone(),
            ),
            is_partial,
        ))
    }

    /// Runs `f` against every shard concurrently, collecting all results
    /// through a channel with exactly one slot per shard so no task can
    /// ever block on send.
    async fn scatter<T, F, Fut>(&self, f: F) -> Vec<Result<T, Error>>
    where
        T: Send + 'static,
        F: Fn(Arc<StorageNode>) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(self.nodes.len());
        for node in &self.nodes {
            let tx = tx.clone();
            let fut = f(Arc::clone(node));
            tokio::spawn(async move {
                // Send cannot block (one slot per shard); it only fails if
                // the collector is gone, in which case the result is moot.
                let _ = tx.send(fut.await).await;
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(self.nodes.len());
        while let Some(res) = rx.recv().await {
            results.push(res);
        }
        results
    }

    /// Shared some-failed/all-failed aggregation for the union verbs.
    fn aggregate_union<T>(
        &self,
        results: Vec<Result<Vec<T>, Error>>,
        partial_counter: &U64Counter,
        what: &'static str,
    ) -> Result<(Vec<T>, bool), Error> {
        let mut union = Vec::new();
        let mut first_err = None;
        let mut failed = 0;
        for res in results {
            match res {
                Ok(items) => union.extend(items),
                Err(e) => {
                    failed += 1;
                    first_err = first_err.or(Some(e));
                }
            }
        }

        match first_err {
            Some(err) if failed == self.nodes.len() => Err(err),
            Some(err) => {
                // Degrade gracefully when only some shards are unhealthy.
                partial_counter.inc(1);
                error!(%err, "certain storage nodes are unhealthy when {what}");
                Ok((union, true))
            }
            None => Ok((union, false)),
        }
    }
}
