//! Per-shard RPC client.
//!
//! Every verb follows the same skeleton: try-acquire a slot on the
//! shard's concurrency gate, borrow a pooled connection, write the verb
//! name and arguments, read the in-band error frame, read the reply,
//! then return the connection to the pool (success or remote error) or
//! drop it (any local error).
//!
//! Each verb is attempted twice back-to-back. Many transient failures
//! are stale pooled connections, and the end-to-end deadline already
//! bounds total latency, so anything smarter than one blind retry is
//! not worth its complexity here.

use crate::codec::{
    BufferedConn, RpcError, MAX_ERROR_MESSAGE_SIZE, MAX_LABEL_SIZE, MAX_METRIC_BLOCK_SIZE,
};
use crate::handshake::{INSERT_CLIENT_ROLE, SELECT_CLIENT_ROLE};
use crate::pool::ConnPool;
use crate::Error;
use data_types::{Deadline, LabelEntry, MetricBlock, Tenant};
use metric::{Metric, U64Counter, U64Gauge};
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Semaphore;

/// The maximum number of concurrent queries sent to one storage node.
///
/// Back-pressure is rejected at this gate rather than queued: queries
/// already carry an end-to-end deadline from the admission gate, and
/// queueing here would only convert overload into timeouts.
pub const MAX_CONCURRENT_QUERIES_PER_STORAGE_NODE: usize = 100;

/// How long a single insert-path packet push may take.
const INSERT_PUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct VerbMetrics {
    requests: U64Counter,
    errors: U64Counter,
}

#[derive(Debug)]
struct StorageNodeMetrics {
    delete_series: VerbMetrics,
    labels: VerbMetrics,
    label_values: VerbMetrics,
    label_entries: VerbMetrics,
    series_count: VerbMetrics,
    search: VerbMetrics,
    push: VerbMetrics,

    /// The number of metric blocks read from this node.
    metric_blocks_read: U64Counter,

    /// The number of metric rows read from this node.
    metric_rows_read: U64Counter,

    /// The number of metric rows pushed to this node.
    metric_rows_pushed: U64Counter,

    /// Live fill of the per-node concurrency gate.
    concurrent_queries: U64Gauge,
}

impl StorageNodeMetrics {
    fn new(registry: &metric::Registry, addr: &str) -> Self {
        let requests: Metric<U64Counter> = registry.register_metric(
            "storage_node_requests",
            "total number of RPC requests issued to a storage node",
        );
        let errors: Metric<U64Counter> = registry.register_metric(
            "storage_node_request_errors",
            "total number of failed RPC requests to a storage node",
        );
        let verb = |name: &'static str| VerbMetrics {
            requests: requests.recorder(verb_attributes(addr, name)),
            errors: errors.recorder(verb_attributes(addr, name)),
        };

        Self {
            delete_series: verb("delete_series"),
            labels: verb("labels"),
            label_values: verb("label_values"),
            label_entries: verb("label_entries"),
            series_count: verb("series_count"),
            search: verb("search"),
            push: verb("push"),
            metric_blocks_read: registry
                .register_metric::<U64Counter>(
                    "storage_node_metric_blocks_read",
                    "total number of metric blocks read from a storage node",
                )
                .recorder(addr_attributes(addr)),
            metric_rows_read: registry
                .register_metric::<U64Counter>(
                    "storage_node_metric_rows_read",
                    "total number of metric rows read from a storage node",
                )
                .recorder(addr_attributes(addr)),
            metric_rows_pushed: registry
                .register_metric::<U64Counter>(
                    "storage_node_metric_rows_pushed",
                    "total number of metric rows pushed to a storage node",
                )
                .recorder(addr_attributes(addr)),
            concurrent_queries: registry
                .register_metric::<U64Gauge>(
                    "storage_node_concurrent_queries",
                    "number of in-flight queries to a storage node",
                )
                .recorder(addr_attributes(addr)),
        }
    }
}

fn addr_attributes(addr: &str) -> metric::Attributes {
    metric::Attributes::from([("addr", Cow::Owned(addr.to_owned()))])
}

fn verb_attributes(addr: &str, verb: &'static str) -> metric::Attributes {
    metric::Attributes::from([
        ("addr", Cow::Owned(addr.to_owned())),
        ("verb", Cow::Borrowed(verb)),
    ])
}

/// A single storage shard: its address, connection pools, concurrency
/// gate and counters.
///
/// The node's position in the cluster's ordered shard list is its
/// permanent routing identity.
#[derive(Debug)]
pub struct StorageNode {
    addr: String,
    select_pool: ConnPool,
    insert_pool: ConnPool,
    concurrent_queries: Semaphore,
    concurrent_query_limit: usize,
    metrics: StorageNodeMetrics,
}

impl StorageNode {
    pub(crate) fn new(addr: String, concurrency_limit: usize, registry: &metric::Registry) -> Self {
        Self {
            select_pool: ConnPool::new("select", addr.clone(), SELECT_CLIENT_ROLE),
            insert_pool: ConnPool::new("insert", addr.clone(), INSERT_CLIENT_ROLE),
            concurrent_queries: Semaphore::new(concurrency_limit),
            concurrent_query_limit: concurrency_limit,
            metrics: StorageNodeMetrics::new(registry, &addr),
            addr,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Deletes all series matching the marshalled search query, returning
    /// the number of deleted series.
    pub(crate) async fn delete_metrics(
        &self,
        request_data: &[u8],
        deadline: Deadline,
    ) -> Result<u64, Error> {
        self.metrics.delete_series.requests.inc(1);
        let mut deleted_count = 0u64;

        let attempt = || {
            self.exec_on_conn("deleteMetrics_v2", deadline, |mut conn| async move {
                let res = delete_metrics_on_conn(&mut conn, request_data).await;
                (conn, res)
            })
        };
        match attempt().await {
            Ok(n) => deleted_count += n,
            Err(_) => {
                // Try again before giving up. There is no need to zero
                // deleted_count: deletion is idempotent on the storage side.
                match attempt().await {
                    Ok(n) => deleted_count += n,
                    Err(e) => {
                        self.metrics.delete_series.errors.inc(1);
                        return Err(e);
                    }
                }
            }
        }
        Ok(deleted_count)
    }

    pub(crate) async fn get_labels(
        &self,
        tenant: Tenant,
        deadline: Deadline,
    ) -> Result<Vec<String>, Error> {
        self.metrics.labels.requests.inc(1);
        let attempt = || {
            self.exec_on_conn("labels", deadline, |mut conn| async move {
                let res = labels_on_conn(&mut conn, tenant).await;
                (conn, res)
            })
        };
        let res = retry_once(attempt).await;
        if res.is_err() {
            self.metrics.labels.errors.inc(1);
        }
        res
    }

    pub(crate) async fn get_label_values(
        &self,
        tenant: Tenant,
        label_name: &str,
        deadline: Deadline,
    ) -> Result<Vec<String>, Error> {
        self.metrics.label_values.requests.inc(1);
        let attempt = || {
            self.exec_on_conn("labelValues", deadline, |mut conn| async move {
                let res = label_values_on_conn(&mut conn, tenant, label_name).await;
                (conn, res)
            })
        };
        let res = retry_once(attempt).await;
        if res.is_err() {
            self.metrics.label_values.errors.inc(1);
        }
        res
    }

    pub(crate) async fn get_label_entries(
        &self,
        tenant: Tenant,
        deadline: Deadline,
    ) -> Result<Vec<LabelEntry>, Error> {
        self.metrics.label_entries.requests.inc(1);
        let attempt = || {
            self.exec_on_conn("labelEntries", deadline, |mut conn| async move {
                let res = label_entries_on_conn(&mut conn, tenant).await;
                (conn, res)
            })
        };
        let res = retry_once(attempt).await;
        if res.is_err() {
            self.metrics.label_entries.errors.inc(1);
        }
        res
    }

    pub(crate) async fn get_series_count(
        &self,
        tenant: Tenant,
        deadline: Deadline,
    ) -> Result<u64, Error> {
        self.metrics.series_count.requests.inc(1);
        let attempt = || {
            self.exec_on_conn("seriesCount", deadline, |mut conn| async move {
                let res = series_count_on_conn(&mut conn, tenant).await;
                (conn, res)
            })
        };
        let res = retry_once(attempt).await;
        if res.is_err() {
            self.metrics.series_count.errors.inc(1);
        }
        res
    }

    /// Runs the marshalled search query, returning every matching metric
    /// block this node holds.
    pub(crate) async fn process_search_query(
        &self,
        request_data: &[u8],
        deadline: Deadline,
    ) -> Result<Vec<MetricBlock>, Error> {
        self.metrics.search.requests.inc(1);
        let attempt = || {
            self.exec_on_conn("search_v2", deadline, |mut conn| async move {
                let res = search_on_conn(&mut conn, request_data).await;
                (conn, res)
            })
        };
        let res = retry_once(attempt).await;
        match &res {
            Ok(blocks) => {
                self.metrics.metric_blocks_read.inc(blocks.len() as u64);
                let rows: usize = blocks.iter().map(|mb| mb.block.rows_count()).sum();
                self.metrics.metric_rows_read.inc(rows as u64);
            }
            Err(_) => self.metrics.search.errors.inc(1),
        }
        res
    }

    /// Pushes one insert-path packet of marshalled rows.
    ///
    /// Unlike the read verbs there is no retry: the insert context
    /// surfaces the first push error to its caller immediately.
    pub(crate) async fn push(&self, buf: &[u8], rows: usize) -> Result<(), Error> {
        self.metrics.push.requests.inc(1);
        let deadline = Deadline::new(INSERT_PUSH_TIMEOUT);

        let res = async {
            let mut conn = self
                .insert_pool
                .get(deadline)
                .await
                .map_err(|source| self.push_error(buf.len(), source))?;
            match push_on_conn(&mut conn, buf).await {
                Ok(()) => {
                    self.insert_pool.put(conn);
                    Ok(())
                }
                Err(source) => {
                    if source.is_remote() {
                        self.insert_pool.put(conn);
                    }
                    Err(self.push_error(buf.len(), source))
                }
            }
        }
        .await;

        match &res {
            Ok(()) => self.metrics.metric_rows_pushed.inc(rows as u64),
            Err(_) => self.metrics.push.errors.inc(1),
        }
        res
    }

    /// The shared verb skeleton: gate, borrow, write verb, run `f`,
    /// return or drop the connection based on the error classification.
    async fn exec_on_conn<T, F, Fut>(
        &self,
        verb: &'static str,
        deadline: Deadline,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(BufferedConn) -> Fut,
        Fut: Future<Output = (BufferedConn, Result<T, RpcError>)>,
    {
        // Non-blocking acquire: fail fast instead of queueing behind a
        // node that has become a tar-pit.
        let _permit = match self.concurrent_queries.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(Error::TooManyConcurrentQueries {
                    addr: self.addr.clone(),
                    limit: self.concurrent_query_limit,
                })
            }
        };

        self.metrics.concurrent_queries.inc(1);
        let res = self.exec_on_conn_gated(verb, deadline, f).await;
        self.metrics.concurrent_queries.dec(1);
        res
    }

    async fn exec_on_conn_gated<T, F, Fut>(
        &self,
        verb: &'static str,
        deadline: Deadline,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(BufferedConn) -> Fut,
        Fut: Future<Output = (BufferedConn, Result<T, RpcError>)>,
    {
        let mut conn = self
            .select_pool
            .get(deadline)
            .await
            .map_err(|source| self.rpc_error(verb, deadline, source))?;

        if let Err(source) = conn.write_bytes(verb.as_bytes()).await {
            // The socket may be broken; drop the connection.
            return Err(self.rpc_error(verb, deadline, source));
        }

        let (conn, res) = f(conn).await;
        match res {
            Ok(v) => {
                self.select_pool.put(conn);
                Ok(v)
            }
            Err(source) => {
                // A remote error leaves the connection usable; anything
                // local means the stream state is unknown.
                if source.is_remote() {
                    self.select_pool.put(conn);
                }
                Err(self.rpc_error(verb, deadline, source))
            }
        }
    }

    fn rpc_error(&self, verb: &'static str, deadline: Deadline, source: RpcError) -> Error {
        Error::Rpc {
            verb,
            addr: self.addr.clone(),
            timeout: deadline.timeout(),
            source,
        }
    }

    fn push_error(&self, bytes: usize, source: RpcError) -> Error {
        Error::Push {
            addr: self.addr.clone(),
            bytes,
            source,
        }
    }
}

/// Runs `attempt` and retries it exactly once on any error, discarding
/// the first error.
async fn retry_once<T, F, Fut>(attempt: F) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    match attempt().await {
        Ok(v) => Ok(v),
        Err(_) => attempt().await,
    }
}

/// Reads the reply's error frame; a non-empty payload is an in-band
/// remote error.
async fn read_error_frame(conn: &mut BufferedConn) -> Result<(), RpcError> {
    let buf = conn.read_bytes(MAX_ERROR_MESSAGE_SIZE).await?;
    if !buf.is_empty() {
        return Err(RpcError::Remote {
            message: String::from_utf8_lossy(&buf).into_owned(),
        });
    }
    Ok(())
}

async fn delete_metrics_on_conn(
    conn: &mut BufferedConn,
    request_data: &[u8],
) -> Result<u64, RpcError> {
    conn.write_bytes(request_data).await?;
    conn.flush().await?;

    read_error_frame(conn).await?;
    conn.read_u64().await
}

async fn labels_on_conn(conn: &mut BufferedConn, tenant: Tenant) -> Result<Vec<String>, RpcError> {
    conn.write_u32(tenant.account_id).await?;
    conn.write_u32(tenant.project_id).await?;
    conn.flush().await?;

    read_error_frame(conn).await?;
    read_string_list(conn).await
}

async fn label_values_on_conn(
    conn: &mut BufferedConn,
    tenant: Tenant,
    label_name: &str,
) -> Result<Vec<String>, RpcError> {
    conn.write_u32(tenant.account_id).await?;
    conn.write_u32(tenant.project_id).await?;
    conn.write_bytes(label_name.as_bytes()).await?;
    conn.flush().await?;

    read_error_frame(conn).await?;
    read_string_list(conn).await
}

async fn label_entries_on_conn(
    conn: &mut BufferedConn,
    tenant: Tenant,
) -> Result<Vec<LabelEntry>, RpcError> {
    conn.write_u32(tenant.account_id).await?;
    conn.write_u32(tenant.project_id).await?;
    conn.flush().await?;

    read_error_frame(conn).await?;

    let mut entries = Vec::new();
    loop {
        let key = conn.read_bytes(MAX_LABEL_SIZE).await?;
        if key.is_empty() {
            // Outer terminator: end of the reply.
            return Ok(entries);
        }
        let values = read_string_list(conn).await?;
        entries.push(LabelEntry {
            key: String::from_utf8_lossy(&key).into_owned(),
            values,
        });
    }
}

async fn series_count_on_conn(conn: &mut BufferedConn, tenant: Tenant) -> Result<u64, RpcError> {
    conn.write_u32(tenant.account_id).await?;
    conn.write_u32(tenant.project_id).await?;
    conn.flush().await?;

    read_error_frame(conn).await?;
    conn.read_u64().await
}

async fn search_on_conn(
    conn: &mut BufferedConn,
    request_data: &[u8],
) -> Result<Vec<MetricBlock>, RpcError> {
    conn.write_bytes(request_data).await?;
    conn.flush().await?;

    read_error_frame(conn).await?;

    let mut blocks = Vec::new();
    loop {
        let buf = conn.read_bytes(MAX_METRIC_BLOCK_SIZE).await?;
        if buf.is_empty() {
            return Ok(blocks);
        }
        blocks.push(MetricBlock::unmarshal(&buf)?);
    }
}

async fn push_on_conn(conn: &mut BufferedConn, buf: &[u8]) -> Result<(), RpcError> {
    conn.write_bytes(buf).await?;
    conn.flush().await?;
    read_error_frame(conn).await
}

/// Reads bytes frames into strings until the zero-length terminator.
async fn read_string_list(conn: &mut BufferedConn) -> Result<Vec<String>, RpcError> {
    let mut out = Vec::new();
    loop {
        let buf = conn.read_bytes(MAX_LABEL_SIZE).await?;
        if buf.is_empty() {
            return Ok(out);
        }
        out.push(String::from_utf8_lossy(&buf).into_owned());
    }
}
