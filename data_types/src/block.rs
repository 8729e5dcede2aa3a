use crate::encoding::{self, DecodeError};
use thiserror::Error;

/// Errors converting blocks and rows to/from their wire form.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("timestamps and values lengths differ: {timestamps} vs {values}")]
    LengthMismatch { timestamps: usize, values: usize },

    #[error("timestamps are not sorted at index {0}")]
    Unsorted(usize),

    #[error("block row count {rows} exceeds the maximum of {max}")]
    TooManyRows { rows: usize, max: usize },

    #[error("trailing {0} bytes after block")]
    TrailingData(usize),

    #[error("cannot decode block: {0}")]
    Decode(#[from] DecodeError),
}

/// The maximum number of rows a single block may carry.
///
/// Keeps a hostile length prefix from driving a huge allocation; the
/// 1 MiB frame cap bounds the wire size independently.
pub const MAX_BLOCK_ROWS: usize = 8 * 1024;

/// A compressed run of samples from one series.
///
/// Timestamps are sorted ascending. On the wire the row count is followed
/// by zig-zag varint timestamp deltas and raw little-endian values:
///
/// ```text
/// u32 rows | varint ts[0] | varint (ts[i]-ts[i-1])* | f64 value*
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    timestamps: Vec<i64>,
    values: Vec<f64>,
}

impl Block {
    /// Creates a block, validating the sort and length invariants.
    pub fn new(timestamps: Vec<i64>, values: Vec<f64>) -> Result<Self, BlockError> {
        if timestamps.len() != values.len() {
            return Err(BlockError::LengthMismatch {
                timestamps: timestamps.len(),
                values: values.len(),
            });
        }
        if timestamps.len() > MAX_BLOCK_ROWS {
            return Err(BlockError::TooManyRows {
                rows: timestamps.len(),
                max: MAX_BLOCK_ROWS,
            });
        }
        if let Some(i) = (1..timestamps.len()).find(|&i| timestamps[i] < timestamps[i - 1]) {
            return Err(BlockError::Unsorted(i));
        }
        Ok(Self { timestamps, values })
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn rows_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Appends the wire form of this block to `dst`.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        encoding::marshal_u32(dst, self.timestamps.len() as u32);
        let mut prev = 0;
        for (i, &ts) in self.timestamps.iter().enumerate() {
            if i == 0 {
                encoding::marshal_var_i64(dst, ts);
            } else {
                encoding::marshal_var_i64(dst, ts.wrapping_sub(prev));
            }
            prev = ts;
        }
        for &v in &self.values {
            encoding::marshal_f64(dst, v);
        }
    }

    /// Decodes a block from its wire form, returning the remaining bytes.
    pub fn unmarshal(src: &[u8]) -> Result<(Self, &[u8]), BlockError> {
        let (rows, mut rest) = encoding::unmarshal_u32(src)?;
        let rows = rows as usize;
        if rows > MAX_BLOCK_ROWS {
            return Err(BlockError::TooManyRows {
                rows,
                max: MAX_BLOCK_ROWS,
            });
        }

        let mut timestamps = Vec::with_capacity(rows);
        let mut prev = 0i64;
        for i in 0..rows {
            let (delta, tail) = encoding::unmarshal_var_i64(rest)?;
            let ts = if i == 0 { delta } else { prev.wrapping_add(delta) };
            if i > 0 && ts < prev {
                return Err(BlockError::Unsorted(i));
            }
            timestamps.push(ts);
            prev = ts;
            rest = tail;
        }

        let mut values = Vec::with_capacity(rows);
        for _ in 0..rows {
            let (v, tail) = encoding::unmarshal_f64(rest)?;
            values.push(v);
            rest = tail;
        }

        Ok((Self { timestamps, values }, rest))
    }
}

/// A block paired with the raw metric name that owns it, as returned by
/// the `search_v2` verb.
///
/// Wire form: `u32 len | metricNameRaw | block`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricBlock {
    pub metric_name_raw: Vec<u8>,
    pub block: Block,
}

impl MetricBlock {
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        encoding::marshal_bytes_u32(dst, &self.metric_name_raw);
        self.block.marshal(dst);
    }

    /// Decodes a metric block, consuming all of `src`.
    pub fn unmarshal(src: &[u8]) -> Result<Self, BlockError> {
        let (name, rest) = encoding::unmarshal_bytes_u32(src)?;
        let (block, rest) = Block::unmarshal(rest)?;
        if !rest.is_empty() {
            return Err(BlockError::TrailingData(rest.len()));
        }
        Ok(Self {
            metric_name_raw: name.to_vec(),
            block,
        })
    }
}

/// Appends one insert-path row: `u32 len | metricNameRaw | i64 ts | f64 value`.
pub fn marshal_metric_row(dst: &mut Vec<u8>, metric_name_raw: &[u8], timestamp: i64, value: f64) {
    encoding::marshal_bytes_u32(dst, metric_name_raw);
    encoding::marshal_i64(dst, timestamp);
    encoding::marshal_f64(dst, value);
}

/// Decodes one insert-path row, returning `(name, ts, value)` and the
/// remaining bytes.
pub fn unmarshal_metric_row(src: &[u8]) -> Result<(&[u8], i64, f64, &[u8]), DecodeError> {
    let (name, rest) = encoding::unmarshal_bytes_u32(src)?;
    let (timestamp, rest) = encoding::unmarshal_i64(rest)?;
    let (value, rest) = encoding::unmarshal_f64(rest)?;
    Ok((name, timestamp, value, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn block_round_trip() {
        let block = Block::new(vec![1000, 2000, 2000, 5000], vec![1.5, 2.5, -3.0, 0.0]).unwrap();
        let mut buf = Vec::new();
        block.marshal(&mut buf);

        let (got, rest) = Block::unmarshal(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(got, block);
    }

    #[test]
    fn empty_block_round_trip() {
        let block = Block::default();
        let mut buf = Vec::new();
        block.marshal(&mut buf);
        let (got, rest) = Block::unmarshal(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(got.rows_count(), 0);
    }

    #[test]
    fn unsorted_timestamps_are_rejected() {
        assert_matches!(
            Block::new(vec![5, 3], vec![0.0, 0.0]),
            Err(BlockError::Unsorted(1))
        );
    }

    #[test]
    fn metric_block_round_trip() {
        let mb = MetricBlock {
            metric_name_raw: b"raw-name".to_vec(),
            block: Block::new(vec![10, 20], vec![0.5, 0.25]).unwrap(),
        };
        let mut buf = Vec::new();
        mb.marshal(&mut buf);
        let got = MetricBlock::unmarshal(&buf).unwrap();
        assert_eq!(got, mb);
    }

    #[test]
    fn metric_row_round_trip() {
        let mut buf = Vec::new();
        marshal_metric_row(&mut buf, b"name", 12345, 6.25);
        marshal_metric_row(&mut buf, b"other", -5, 0.0);

        let (name, ts, value, rest) = unmarshal_metric_row(&buf).unwrap();
        assert_eq!(name, b"name");
        assert_eq!(ts, 12345);
        assert_eq!(value, 6.25);

        let (name, ts, value, rest) = unmarshal_metric_row(rest).unwrap();
        assert_eq!(name, b"other");
        assert_eq!(ts, -5);
        assert_eq!(value, 0.0);
        assert!(rest.is_empty());
    }
}
