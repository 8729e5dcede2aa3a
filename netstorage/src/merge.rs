//! Two-level parallel unpack and k-way merge of search results.
//!
//! [`SearchResults`] holds one packed timeseries per distinct metric
//! name. [`SearchResults::run_parallel`] fans the series out over a
//! bounded set of consumers; each consumer reads its series' blocks from
//! the spill file (again with bounded parallelism), clips them to the
//! query time range, and merges them into a single chronological stream
//! before handing the series to the caller.
//!
//! The merge is optimised for the common case of non-overlapping
//! consecutive blocks: when the top block's last timestamp does not pass
//! the next block's head, its whole remainder is emitted at once.

use crate::spill::{BlockAddr, FinalizedSpill};
use crate::Error;
use data_types::{Block, BlockError, Deadline, MetricName, TimeRange};
use futures::stream::{self, StreamExt};
use metric::U64Counter;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One merged timeseries handed to the downstream evaluator.
///
/// `timestamps` are monotone non-decreasing and aligned with `values`.
#[derive(Debug, Default)]
pub struct Series {
    pub metric_name: MetricName,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

impl Series {
    fn reset(&mut self) {
        self.metric_name = MetricName::default();
        self.timestamps.clear();
        self.values.clear();
    }
}

/// A metric name plus the spill addresses of every block the shards
/// returned for it.
#[derive(Debug)]
pub(crate) struct PackedTimeseries {
    pub(crate) metric_name_raw: Vec<u8>,
    pub(crate) addrs: Vec<BlockAddr>,
}

/// The outcome of a successful scatter: per-series block addresses over
/// a finalized spill file.
///
/// Dropping (or [`cancel`](Self::cancel)-ing) the results releases the
/// spill file; in-flight workers run to completion.
#[derive(Debug)]
pub struct SearchResults {
    time_range: TimeRange,
    deadline: Deadline,
    spill: FinalizedSpill,
    packed: Vec<PackedTimeseries>,
    rows_skipped: U64Counter,
}

impl SearchResults {
    pub(crate) fn new(
        time_range: TimeRange,
        deadline: Deadline,
        spill: FinalizedSpill,
        packed: Vec<PackedTimeseries>,
        rows_skipped: U64Counter,
    ) -> Self {
        Self {
            time_range,
            deadline,
            spill,
            packed,
            rows_skipped,
        }
    }

    /// The number of distinct timeseries in these results.
    pub fn len(&self) -> usize {
        self.packed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packed.is_empty()
    }

    /// Abandons the results and releases the spill file.
    pub fn cancel(self) {}

    /// Unpacks and merges every timeseries, invoking `f` once per
    /// non-empty merged series.
    ///
    /// `f` may be invoked from multiple workers concurrently. The first
    /// error observed is returned; the spill file is released
    /// unconditionally.
    pub async fn run_parallel<F>(mut self, f: F) -> Result<(), Error>
    where
        F: Fn(&Series) + Send + Sync,
    {
        let packed = std::mem::take(&mut self.packed);
        if packed.is_empty() {
            return Ok(());
        }

        let ncpu = num_cpus::get().max(1);
        let workers_outer = (1 + packed.len() / 32).min(ncpu);
        // Each outer consumer gets a static fair share of the CPU budget
        // for its inner unpack workers.
        let max_inner = (ncpu / workers_outer).max(1);

        let spill = &self.spill;
        let rows_skipped = &self.rows_skipped;
        let time_range = self.time_range;
        let deadline = self.deadline;
        let f = &f;

        let results: Vec<Result<(), Error>> = stream::iter(packed.into_iter().map(|pts| {
            async move {
                // The deadline is the only cancellation primitive: a
                // consumer that dequeues past it drops the remaining work.
                if deadline.exceeded() {
                    return Err(Error::QueryTimeout {
                        timeout: deadline.timeout(),
                    });
                }

                let mut series = series_pool().get();
                unpack(&mut series, pts, spill, time_range, max_inner, rows_skipped).await?;
                if !series.timestamps.is_empty() {
                    f(&series);
                }
                put_series(series);
                Ok(())
            }
        }))
        .buffer_unordered(workers_outer)
        .collect()
        .await;

        // Return just the first error; the rest are expected to be
        // duplicates of the same root cause.
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }
}

/// Reads, decodes and merges all blocks of one packed timeseries into
/// `dst`.
async fn unpack(
    dst: &mut Series,
    pts: PackedTimeseries,
    spill: &FinalizedSpill,
    time_range: TimeRange,
    max_inner: usize,
    rows_skipped: &U64Counter,
) -> Result<(), Error> {
    dst.reset();
    dst.metric_name = MetricName::unmarshal_raw(&pts.metric_name_raw)
        .map_err(|source| Error::MetricName { source })?;

    let workers_inner = (1 + pts.addrs.len() / 32).min(max_inner).max(1);
    let results: Vec<Result<SortBlock, Error>> = stream::iter(
        pts.addrs
            .into_iter()
            .map(|addr| async move { unpack_block(spill, addr, time_range, rows_skipped) }),
    )
    .buffer_unordered(workers_inner)
    .collect()
    .await;

    let mut sort_blocks = Vec::with_capacity(results.len());
    let mut first_err = None;
    for res in results {
        match res {
            Ok(sb) => sort_blocks.push(sb),
            Err(e) => first_err = first_err.or(Some(e)),
        }
    }
    if let Some(e) = first_err {
        for sb in sort_blocks {
            put_sort_block(sb);
        }
        return Err(e);
    }

    merge_sort_blocks(dst, sort_blocks);
    Ok(())
}

/// Reads one block from the spill file, decodes it and clips it to the
/// query time range.
fn unpack_block(
    spill: &FinalizedSpill,
    addr: BlockAddr,
    time_range: TimeRange,
    rows_skipped: &U64Counter,
) -> Result<SortBlock, Error> {
    let mut sb = sort_block_pool().get();
    spill
        .read_block_at(addr, &mut sb.buf)
        .map_err(|source| Error::SpillRead { source })?;

    let (block, rest) = Block::unmarshal(&sb.buf).map_err(|source| Error::Block { source })?;
    if !rest.is_empty() {
        return Err(Error::Block {
            source: BlockError::TrailingData(rest.len()),
        });
    }

    let timestamps = block.timestamps();

    // Skip rows strictly outside [min_timestamp, max_timestamp].
    let mut i = 0;
    while i < timestamps.len() && timestamps[i] < time_range.min_timestamp {
        i += 1;
    }
    let mut j = timestamps.len();
    while j > i && timestamps[j - 1] > time_range.max_timestamp {
        j -= 1;
    }
    let skipped = block.rows_count() - (j - i);
    if skipped > 0 {
        rows_skipped.inc(skipped as u64);
    }

    sb.timestamps.extend_from_slice(&timestamps[i..j]);
    sb.values.extend_from_slice(&block.values()[i..j]);
    Ok(sb)
}

/// A decoded block view positioned for merging.
///
/// Invariant while on the heap: `next_idx < timestamps.len()`.
#[derive(Debug, Default)]
struct SortBlock {
    /// Scratch for the raw spill payload.
    buf: Vec<u8>,
    timestamps: Vec<i64>,
    values: Vec<f64>,
    next_idx: usize,
}

impl SortBlock {
    fn reset(&mut self) {
        self.buf.clear();
        self.timestamps.clear();
        self.values.clear();
        self.next_idx = 0;
    }

    fn head_timestamp(&self) -> i64 {
        self.timestamps[self.next_idx]
    }
}

/// Min-heap adapter: orders sort blocks by their first remaining
/// timestamp, smallest first.
struct HeapEntry(SortBlock);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.head_timestamp() == other.0.head_timestamp()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, the merge needs the
        // smallest head timestamp on top.
        other.0.head_timestamp().cmp(&self.0.head_timestamp())
    }
}

/// Merges timestamp-sorted blocks of one series into `dst` in a single
/// chronological stream.
fn merge_sort_blocks(dst: &mut Series, sort_blocks: Vec<SortBlock>) {
    let mut heap = BinaryHeap::with_capacity(sort_blocks.len());
    for sb in sort_blocks {
        // Empty blocks cannot participate in the heap ordering.
        if sb.timestamps.is_empty() {
            put_sort_block(sb);
        } else {
            heap.push(HeapEntry(sb));
        }
    }

    while let Some(HeapEntry(mut top)) = heap.pop() {
        let Some(HeapEntry(next)) = heap.peek() else {
            dst.timestamps.extend_from_slice(&top.timestamps[top.next_idx..]);
            dst.values.extend_from_slice(&top.values[top.next_idx..]);
            put_sort_block(top);
            return;
        };

        let ts_next = next.head_timestamp();
        let mut idx_next = top.timestamps.len();
        if top.timestamps[idx_next - 1] > ts_next {
            // Overlap: emit only the prefix of the top block that stays
            // at or before the next block's head.
            idx_next = top.next_idx;
            while top.timestamps[idx_next] <= ts_next {
                idx_next += 1;
            }
        }

        dst.timestamps
            .extend_from_slice(&top.timestamps[top.next_idx..idx_next]);
        dst.values.extend_from_slice(&top.values[top.next_idx..idx_next]);

        if idx_next < top.timestamps.len() {
            top.next_idx = idx_next;
            heap.push(HeapEntry(top));
        } else {
            put_sort_block(top);
        }
    }
}

/// A shared free-list; pooled objects are reset before reuse.
#[derive(Debug)]
struct FreeList<T> {
    free: Mutex<Vec<T>>,
}

impl<T: Default> FreeList<T> {
    const fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> T {
        self.free.lock().pop().unwrap_or_default()
    }

    fn put(&self, value: T) {
        self.free.lock().push(value);
    }
}

/// Series with value buffers beyond this size are dropped instead of
/// pooled so the pool cannot accumulate huge allocations.
const MAX_POOLED_SERIES_VALUES: usize = 8192;

static SERIES_POOL: FreeList<Series> = FreeList::new();
static SORT_BLOCK_POOL: FreeList<SortBlock> = FreeList::new();

fn series_pool() -> &'static FreeList<Series> {
    &SERIES_POOL
}

fn sort_block_pool() -> &'static FreeList<SortBlock> {
    &SORT_BLOCK_POOL
}

fn put_series(mut series: Series) {
    if series.values.len() > MAX_POOLED_SERIES_VALUES {
        return;
    }
    series.reset();
    SERIES_POOL.put(series);
}

fn put_sort_block(mut sb: SortBlock) {
    sb.reset();
    SORT_BLOCK_POOL.put(sb);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sort_block(timestamps: &[i64], values: &[f64]) -> SortBlock {
        SortBlock {
            buf: Vec::new(),
            timestamps: timestamps.to_vec(),
            values: values.to_vec(),
            next_idx: 0,
        }
    }

    fn merged(blocks: Vec<SortBlock>) -> (Vec<i64>, Vec<f64>) {
        let mut dst = Series::default();
        merge_sort_blocks(&mut dst, blocks);
        (dst.timestamps, dst.values)
    }

    #[test]
    fn merge_interleaved_blocks() {
        let (ts, vs) = merged(vec![
            sort_block(&[10, 20, 30], &[1.0, 2.0, 3.0]),
            sort_block(&[15, 25], &[1.5, 2.5]),
        ]);
        assert_eq!(ts, vec![10, 15, 20, 25, 30]);
        assert_eq!(vs, vec![1.0, 1.5, 2.0, 2.5, 3.0]);
    }

    #[test]
    fn merge_non_overlapping_blocks() {
        // The fast path: whole block tails are emitted at once.
        let (ts, vs) = merged(vec![
            sort_block(&[40, 50], &[4.0, 5.0]),
            sort_block(&[10, 20, 30], &[1.0, 2.0, 3.0]),
        ]);
        assert_eq!(ts, vec![10, 20, 30, 40, 50]);
        assert_eq!(vs, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn merge_single_block() {
        let (ts, vs) = merged(vec![sort_block(&[1, 2, 3], &[0.1, 0.2, 0.3])]);
        assert_eq!(ts, vec![1, 2, 3]);
        assert_eq!(vs, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn merge_drops_empty_blocks() {
        let (ts, vs) = merged(vec![
            sort_block(&[], &[]),
            sort_block(&[5], &[0.5]),
            sort_block(&[], &[]),
        ]);
        assert_eq!(ts, vec![5]);
        assert_eq!(vs, vec![0.5]);
    }

    #[test]
    fn merge_of_nothing_is_empty() {
        let (ts, vs) = merged(vec![]);
        assert!(ts.is_empty());
        assert!(vs.is_empty());
    }

    #[test]
    fn merge_with_duplicate_timestamps_stays_sorted() {
        let (ts, _) = merged(vec![
            sort_block(&[10, 10, 20], &[1.0, 1.1, 2.0]),
            sort_block(&[10, 15], &[1.2, 1.5]),
            sort_block(&[5, 25], &[0.5, 2.5]),
        ]);
        let mut sorted = ts.clone();
        sorted.sort();
        assert_eq!(ts, sorted);
        assert_eq!(ts.len(), 7);
    }

    #[test]
    fn merge_many_blocks_is_totally_ordered() {
        let mut blocks = Vec::new();
        for shard in 0..7i64 {
            let timestamps: Vec<i64> = (0..50).map(|i| shard + i * 7).collect();
            let values: Vec<f64> = timestamps.iter().map(|&t| t as f64).collect();
            blocks.push(sort_block(&timestamps, &values));
        }

        let (ts, vs) = merged(blocks);
        assert_eq!(ts.len(), 350);
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
        // Values travel with their timestamps.
        for (t, v) in ts.iter().zip(&vs) {
            assert_eq!(*t as f64, *v);
        }
    }
}
