//! Write-path routing and per-shard batching.
//!
//! An [`InsertCtx`] is per-caller scratch: it accumulates the labels of
//! the current row, routes the row to its shard with the consistent
//! hash, and packs it into that shard's buffer. Buffers flush to their
//! shard when they reach the packet cap and on [`InsertCtx::flush_bufs`].

use crate::{Error, StorageCluster};
use data_types::{marshal_metric_name_raw, marshal_metric_row, Label, Tenant};
use std::sync::Arc;

/// The hard protocol cap on one insert packet.
const MAX_INSERT_PACKET_SIZE: usize = 100 * 1024 * 1024;

/// The per-shard buffer cap: buffers flush before they reach this size.
fn max_buf_size() -> usize {
    (1024 * 1024).min(MAX_INSERT_PACKET_SIZE)
}

#[derive(Debug, Default)]
struct BufRows {
    buf: Vec<u8>,
    rows: usize,
}

/// Per-caller insert scratch: accumulated labels, marshalling buffers
/// and one row buffer per shard.
///
/// Create one per ingestion caller and [`reset`](Self::reset) it between
/// requests; the buffers are retained to amortise allocations.
#[derive(Debug)]
pub struct InsertCtx {
    cluster: Arc<StorageCluster>,

    /// Labels of the row currently being assembled, in caller order.
    ///
    /// The router hashes labels in this exact order; callers must
    /// canonicalize it (sorted, metric name first) before writing.
    pub labels: Vec<Label>,

    metric_name_buf: Vec<u8>,
    fingerprint_buf: Vec<u8>,
    buf_rows: Vec<BufRows>,
}

impl StorageCluster {
    /// Creates an insert context bound to this cluster.
    pub fn insert_ctx(self: &Arc<Self>) -> InsertCtx {
        InsertCtx::new(Arc::clone(self))
    }
}

impl InsertCtx {
    fn new(cluster: Arc<StorageCluster>) -> Self {
        let mut ctx = Self {
            cluster,
            labels: Vec::new(),
            metric_name_buf: Vec::new(),
            fingerprint_buf: Vec::new(),
            buf_rows: Vec::new(),
        };
        ctx.reset();
        ctx
    }

    /// Clears the per-request state, keeping buffer capacity.
    pub fn reset(&mut self) {
        self.labels.clear();
        self.metric_name_buf.clear();
        self.fingerprint_buf.clear();

        if self.buf_rows.is_empty() {
            self.buf_rows
                .resize_with(self.cluster.node_count(), BufRows::default);
        }
        for br in &mut self.buf_rows {
            br.buf.clear();
            br.rows = 0;
        }
    }

    /// Appends a label to the row under assembly.
    pub fn add_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.push(Label::new(name, value));
    }

    /// Routes the assembled row to its shard and appends it to that
    /// shard's buffer, flushing the buffer first if the row would push
    /// it past the packet cap.
    ///
    /// The first push error is returned immediately; buffered data for
    /// sibling shards stays buffered for the caller to retry or discard.
    pub async fn write_data_point(
        &mut self,
        tenant: Tenant,
        timestamp: i64,
        value: f64,
    ) -> Result<(), Error> {
        self.metric_name_buf.clear();
        marshal_metric_name_raw(&mut self.metric_name_buf, tenant, &self.labels)
            .map_err(|source| Error::MetricName { source })?;

        let idx = sharder::shard_index(
            tenant,
            &self.labels,
            &mut self.fingerprint_buf,
            self.cluster.node_count(),
        )
        .map_err(|source| Error::MetricName { source })?;

        let node = Arc::clone(&self.cluster.nodes()[idx]);
        let br = &mut self.buf_rows[idx];

        let row_start = br.buf.len();
        marshal_metric_row(&mut br.buf, &self.metric_name_buf, timestamp, value);

        if br.buf.len() >= max_buf_size() {
            // Ship everything buffered before this row, then restart the
            // buffer with the row alone.
            let row = br.buf.split_off(row_start);
            let pending_rows = br.rows;
            let res = node.push(&br.buf, pending_rows).await;
            br.buf.clear();
            br.rows = 0;
            res?;
            br.buf = row;
        }

        br.rows += 1;
        Ok(())
    }

    /// Flushes every non-empty per-shard buffer.
    ///
    /// On success all buffers are empty and their row counts are zero.
    pub async fn flush_bufs(&mut self) -> Result<(), Error> {
        for (idx, br) in self.buf_rows.iter_mut().enumerate() {
            if br.buf.is_empty() {
                continue;
            }
            let node = &self.cluster.nodes()[idx];
            let res = node.push(&br.buf, br.rows).await;
            br.buf.clear();
            br.rows = 0;
            res?;
        }
        Ok(())
    }
}
