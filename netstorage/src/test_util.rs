//! In-process fake storage node for tests.
//!
//! Speaks the real wire protocol (handshake, framing, verbs) over a
//! loopback TCP listener, stores pushed rows in memory, and supports
//! failure injection: in-band remote errors, one-shot connection resets
//! and full shutdown.
//!
//! Not for production use.

use crate::codec::{BufferedConn, RpcError, MAX_ERROR_MESSAGE_SIZE, MAX_LABEL_SIZE};
use crate::handshake::{server_handshake, INSERT_CLIENT_ROLE};
use data_types::{
    unmarshal_metric_row, Block, Label, MetricBlock, MetricName, SearchQuery, TagFilter,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const MAX_INSERT_PACKET: u64 = 100 * 1024 * 1024;

/// Failure the fake injects into the next interactions.
#[derive(Debug, Default, Clone)]
enum Failure {
    /// Behave normally.
    #[default]
    None,

    /// Answer every verb with an in-band error frame.
    Remote(String),

    /// Drop the connection once (a transport error for the client),
    /// then behave normally.
    ResetOnce,
}

#[derive(Debug, Clone, PartialEq)]
struct StoredRow {
    metric_name_raw: Vec<u8>,
    timestamp: i64,
    value: f64,
}

#[derive(Debug, Default)]
struct NodeState {
    rows: Mutex<Vec<StoredRow>>,
    failure: Mutex<Failure>,
    /// Rows per returned search block; small values force multi-block
    /// series to exercise the merge.
    block_rows: AtomicUsize,
    response_delay: Mutex<Option<Duration>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A fake storage node bound to an ephemeral loopback port.
#[derive(Debug)]
pub struct FakeStorageNode {
    addr: String,
    state: Arc<NodeState>,
    accept_task: JoinHandle<()>,
}

impl FakeStorageNode {
    /// Starts a fake node listening on an ephemeral port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake storage node listener");
        let addr = listener.local_addr().unwrap().to_string();

        let state = Arc::new(NodeState {
            block_rows: AtomicUsize::new(usize::MAX),
            ..Default::default()
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_state = Arc::clone(&accept_state);
                let task = tokio::spawn(async move {
                    let _ = handle_conn(conn_state, stream).await;
                });
                accept_state.conn_tasks.lock().push(task);
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Answers every subsequent verb with an in-band error frame.
    pub fn set_remote_error(&self, message: &str) {
        *self.state.failure.lock() = Failure::Remote(message.to_owned());
    }

    /// Drops the next in-flight connection, then behaves normally.
    pub fn set_reset_once(&self) {
        *self.state.failure.lock() = Failure::ResetOnce;
    }

    pub fn clear_failure(&self) {
        *self.state.failure.lock() = Failure::None;
    }

    /// Caps the number of rows per returned search block.
    pub fn set_block_rows(&self, rows: usize) {
        self.state.block_rows.store(rows.max(1), Ordering::Relaxed);
    }

    /// Delays every verb reply, e.g. to hold the per-shard gate open.
    pub fn set_response_delay(&self, delay: Duration) {
        *self.state.response_delay.lock() = Some(delay);
    }

    /// The number of rows currently stored.
    pub fn row_count(&self) -> usize {
        self.state.rows.lock().len()
    }

    /// Stores a row directly, bypassing the insert protocol. Lets tests
    /// place blocks of one series on several shards, which the router
    /// would never do.
    pub fn insert_row(&self, metric_name: &MetricName, timestamp: i64, value: f64) {
        let mut raw = Vec::new();
        metric_name
            .marshal_raw(&mut raw)
            .expect("invalid metric name");
        self.state.rows.lock().push(StoredRow {
            metric_name_raw: raw,
            timestamp,
            value,
        });
    }

    /// Stops the node: the listener closes and every open connection is
    /// torn down, so clients observe transport errors.
    pub fn shutdown(self) {
        self.accept_task.abort();
        for task in self.state.conn_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for FakeStorageNode {
    fn drop(&mut self) {
        self.accept_task.abort();
        for task in self.state.conn_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn handle_conn(state: Arc<NodeState>, stream: TcpStream) -> Result<(), RpcError> {
    let mut conn = BufferedConn::new(stream);
    let role = server_handshake(&mut conn).await?;

    if role == INSERT_CLIENT_ROLE {
        serve_insert(&state, &mut conn).await
    } else {
        serve_select(&state, &mut conn).await
    }
}

async fn serve_insert(state: &NodeState, conn: &mut BufferedConn) -> Result<(), RpcError> {
    loop {
        let packet = conn.read_bytes(MAX_INSERT_PACKET).await?;

        let failure = state.failure.lock().clone();
        match failure {
            Failure::None => {}
            Failure::Remote(message) => {
                conn.write_bytes(message.as_bytes()).await?;
                conn.flush().await?;
                continue;
            }
            Failure::ResetOnce => {
                *state.failure.lock() = Failure::None;
                return Ok(());
            }
        }

        let mut rest = &packet[..];
        let mut rows = Vec::new();
        while !rest.is_empty() {
            let (name, timestamp, value, tail) =
                unmarshal_metric_row(rest).expect("fake node received a malformed row");
            rows.push(StoredRow {
                metric_name_raw: name.to_vec(),
                timestamp,
                value,
            });
            rest = tail;
        }
        state.rows.lock().extend(rows);

        // Empty error frame acknowledges the packet.
        conn.write_bytes(b"").await?;
        conn.flush().await?;
    }
}

async fn serve_select(state: &NodeState, conn: &mut BufferedConn) -> Result<(), RpcError> {
    loop {
        let verb = conn.read_bytes(MAX_ERROR_MESSAGE_SIZE).await?;

        let delay = *state.response_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = state.failure.lock().clone();
        if let Failure::ResetOnce = failure {
            *state.failure.lock() = Failure::None;
            return Ok(());
        }

        match verb.as_slice() {
            b"labels" => {
                let tenant = read_tenant(conn).await?;
                if reply_injected_error(conn, &failure).await? {
                    continue;
                }
                let mut names: Vec<String> = Vec::new();
                for mn in tenant_metric_names(state, tenant) {
                    for label in mn.labels {
                        names.push(label.name);
                    }
                }
                names.sort();
                names.dedup();
                conn.write_bytes(b"").await?;
                write_string_list(conn, &names).await?;
                conn.flush().await?;
            }
            b"labelValues" => {
                let tenant = read_tenant(conn).await?;
                let label_name = conn.read_bytes(MAX_LABEL_SIZE).await?;
                if reply_injected_error(conn, &failure).await? {
                    continue;
                }
                let label_name = String::from_utf8_lossy(&label_name).into_owned();
                let mut values: Vec<String> = Vec::new();
                for mn in tenant_metric_names(state, tenant) {
                    for label in mn.labels {
                        if label.name == label_name {
                            values.push(label.value);
                        }
                    }
                }
                values.sort();
                values.dedup();
                conn.write_bytes(b"").await?;
                write_string_list(conn, &values).await?;
                conn.flush().await?;
            }
            b"labelEntries" => {
                let tenant = read_tenant(conn).await?;
                if reply_injected_error(conn, &failure).await? {
                    continue;
                }
                let mut entries: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for mn in tenant_metric_names(state, tenant) {
                    for label in mn.labels {
                        entries.entry(label.name).or_default().push(label.value);
                    }
                }
                conn.write_bytes(b"").await?;
                for (key, mut values) in entries {
                    values.sort();
                    values.dedup();
                    conn.write_bytes(key.as_bytes()).await?;
                    write_string_list(conn, &values).await?;
                }
                conn.write_bytes(b"").await?;
                conn.flush().await?;
            }
            b"seriesCount" => {
                let tenant = read_tenant(conn).await?;
                if reply_injected_error(conn, &failure).await? {
                    continue;
                }
                let mut names: Vec<Vec<u8>> = state
                    .rows
                    .lock()
                    .iter()
                    .filter(|row| row_tenant(row) == tenant)
                    .map(|row| row.metric_name_raw.clone())
                    .collect();
                names.sort();
                names.dedup();
                conn.write_bytes(b"").await?;
                conn.write_u64(names.len() as u64).await?;
                conn.flush().await?;
            }
            b"search_v2" => {
                let request = conn.read_bytes(MAX_LABEL_SIZE).await?;
                if reply_injected_error(conn, &failure).await? {
                    continue;
                }
                let sq = SearchQuery::unmarshal(&request)
                    .expect("fake node received a malformed search query");
                let series = matching_series(state, &sq);
                conn.write_bytes(b"").await?;

                let block_rows = state.block_rows.load(Ordering::Relaxed);
                for (metric_name_raw, rows) in series {
                    let timestamps: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
                    let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
                    let step = block_rows.min(timestamps.len()).max(1);
                    for chunk_start in (0..timestamps.len()).step_by(step) {
                        let chunk_end = (chunk_start + step).min(timestamps.len());
                        let mb = MetricBlock {
                            metric_name_raw: metric_name_raw.clone(),
                            block: Block::new(
                                timestamps[chunk_start..chunk_end].to_vec(),
                                values[chunk_start..chunk_end].to_vec(),
                            )
                            .expect("fake node built an invalid block"),
                        };
                        let mut frame = Vec::new();
                        mb.marshal(&mut frame);
                        conn.write_bytes(&frame).await?;
                    }
                }
                conn.write_bytes(b"").await?;
                conn.flush().await?;
            }
            b"deleteMetrics_v2" => {
                let request = conn.read_bytes(MAX_LABEL_SIZE).await?;
                if reply_injected_error(conn, &failure).await? {
                    continue;
                }
                let sq = SearchQuery::unmarshal(&request)
                    .expect("fake node received a malformed delete query");
                let deleted = {
                    let doomed: Vec<Vec<u8>> =
                        matching_series(state, &sq).into_keys().collect();
                    let mut rows = state.rows.lock();
                    rows.retain(|row| !doomed.contains(&row.metric_name_raw));
                    doomed.len()
                };
                conn.write_bytes(b"").await?;
                conn.write_u64(deleted as u64).await?;
                conn.flush().await?;
            }
            _ => {
                conn.write_bytes(b"unknown rpc").await?;
                conn.flush().await?;
            }
        }
    }
}

async fn read_tenant(conn: &mut BufferedConn) -> Result<(u32, u32), RpcError> {
    let account_id = conn.read_u32().await?;
    let project_id = conn.read_u32().await?;
    Ok((account_id, project_id))
}

/// Writes the injected remote error, if any. Returns true if the verb
/// was answered with an error frame.
async fn reply_injected_error(
    conn: &mut BufferedConn,
    failure: &Failure,
) -> Result<bool, RpcError> {
    if let Failure::Remote(message) = failure {
        conn.write_bytes(message.as_bytes()).await?;
        conn.flush().await?;
        return Ok(true);
    }
    Ok(false)
}

async fn write_string_list(conn: &mut BufferedConn, items: &[String]) -> Result<(), RpcError> {
    for item in items {
        conn.write_bytes(item.as_bytes()).await?;
    }
    conn.write_bytes(b"").await?;
    Ok(())
}

fn row_tenant(row: &StoredRow) -> (u32, u32) {
    let mn = MetricName::unmarshal_raw(&row.metric_name_raw)
        .expect("fake node stored a malformed metric name");
    (mn.tenant.account_id, mn.tenant.project_id)
}

fn tenant_metric_names(state: &NodeState, tenant: (u32, u32)) -> Vec<MetricName> {
    let mut names: Vec<Vec<u8>> = state
        .rows
        .lock()
        .iter()
        .filter(|row| row_tenant(row) == tenant)
        .map(|row| row.metric_name_raw.clone())
        .collect();
    names.sort();
    names.dedup();
    names
        .iter()
        .map(|raw| MetricName::unmarshal_raw(raw).expect("fake node stored a malformed name"))
        .collect()
}

/// Rows of every stored series matching the query's tenant and tag
/// filters, keyed by raw metric name, rows sorted by timestamp.
///
/// Time-range filtering is deliberately left to the coordinator: real
/// storage returns whole blocks overlapping the range, and the merge
/// stage clips them.
fn matching_series(state: &NodeState, sq: &SearchQuery) -> BTreeMap<Vec<u8>, Vec<StoredRow>> {
    let mut series: BTreeMap<Vec<u8>, Vec<StoredRow>> = BTreeMap::new();
    for row in state.rows.lock().iter() {
        let mn = MetricName::unmarshal_raw(&row.metric_name_raw)
            .expect("fake node stored a malformed metric name");
        if (mn.tenant.account_id, mn.tenant.project_id)
            != (sq.tenant.account_id, sq.tenant.project_id)
        {
            continue;
        }
        if !series_matches(&mn.labels, &sq.tag_filters) {
            continue;
        }
        series
            .entry(row.metric_name_raw.clone())
            .or_default()
            .push(row.clone());
    }
    for rows in series.values_mut() {
        rows.sort_by_key(|row| row.timestamp);
    }
    series
}

/// Exact-match tag filter evaluation.
///
/// Regexp filters are matched as literals; the fake supports the subset
/// the tests exercise. A matcher on an absent label sees the empty
/// value, per the Prometheus data model.
fn series_matches(labels: &[Label], filters: &[TagFilter]) -> bool {
    filters.iter().all(|tf| {
        let value = labels
            .iter()
            .find(|l| l.name == tf.key)
            .map(|l| l.value.as_str())
            .unwrap_or("");
        (value == tf.value) != tf.is_negative
    })
}
