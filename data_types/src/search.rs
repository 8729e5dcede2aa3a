use crate::encoding::{self, DecodeError};
use crate::Tenant;
use thiserror::Error;

/// An inclusive `[min_timestamp, max_timestamp]` range, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl TimeRange {
    pub fn new(min_timestamp: i64, max_timestamp: i64) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.min_timestamp && timestamp <= self.max_timestamp
    }
}

/// A single label matcher inside a [`SearchQuery`].
///
/// An empty `key` matches the metric name. Regexp matchers are evaluated
/// by the storage shards; the coordinator only transports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
    pub is_negative: bool,
    pub is_regexp: bool,
}

/// Errors converting a [`SearchQuery`] to/from its wire form.
#[derive(Debug, Error)]
pub enum SearchQueryError {
    #[error("tag filter {key:?} is too long: {len} bytes exceeds {max}")]
    FilterTooLong {
        key: String,
        len: usize,
        max: usize,
    },

    #[error("too many tag filters: {0}")]
    TooManyFilters(usize),

    #[error("query data is not valid utf-8")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    #[error("trailing {0} bytes after search query")]
    TrailingData(usize),

    #[error("cannot decode search query: {0}")]
    Decode(#[from] DecodeError),
}

/// The request body of the `search_v2` and `deleteMetrics_v2` verbs.
///
/// Wire form (all little-endian):
///
/// ```text
/// u32 accountID | u32 projectID | i64 minTimestamp | i64 maxTimestamp |
/// u16 filterCount | (u8 flags | u16 len key | u16 len value)*
/// ```
///
/// `flags` bit 0 = negative match, bit 1 = regexp match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub tenant: Tenant,
    pub time_range: TimeRange,
    pub tag_filters: Vec<TagFilter>,
}

const FLAG_NEGATIVE: u8 = 1;
const FLAG_REGEXP: u8 = 2;

impl SearchQuery {
    pub fn new(tenant: Tenant, time_range: TimeRange, tag_filters: Vec<TagFilter>) -> Self {
        Self {
            tenant,
            time_range,
            tag_filters,
        }
    }

    /// Appends the wire form of this query to `dst`.
    pub fn marshal(&self, dst: &mut Vec<u8>) -> Result<(), SearchQueryError> {
        encoding::marshal_u32(dst, self.tenant.account_id);
        encoding::marshal_u32(dst, self.tenant.project_id);
        encoding::marshal_i64(dst, self.time_range.min_timestamp);
        encoding::marshal_i64(dst, self.time_range.max_timestamp);

        if self.tag_filters.len() > u16::MAX as usize {
            return Err(SearchQueryError::TooManyFilters(self.tag_filters.len()));
        }
        encoding::marshal_u16(dst, self.tag_filters.len() as u16);
        for tf in &self.tag_filters {
            for part in [&tf.key, &tf.value] {
                if part.len() > u16::MAX as usize {
                    return Err(SearchQueryError::FilterTooLong {
                        key: tf.key.clone(),
                        len: part.len(),
                        max: u16::MAX as usize,
                    });
                }
            }
            let mut flags = 0u8;
            if tf.is_negative {
                flags |= FLAG_NEGATIVE;
            }
            if tf.is_regexp {
                flags |= FLAG_REGEXP;
            }
            dst.push(flags);
            encoding::marshal_bytes_u16(dst, tf.key.as_bytes());
            encoding::marshal_bytes_u16(dst, tf.value.as_bytes());
        }
        Ok(())
    }

    /// Decodes a query from its wire form, consuming all of `src`.
    pub fn unmarshal(src: &[u8]) -> Result<Self, SearchQueryError> {
        let (account_id, rest) = encoding::unmarshal_u32(src)?;
        let (project_id, rest) = encoding::unmarshal_u32(rest)?;
        let (min_timestamp, rest) = encoding::unmarshal_i64(rest)?;
        let (max_timestamp, rest) = encoding::unmarshal_i64(rest)?;
        let (filter_count, mut rest) = encoding::unmarshal_u16(rest)?;

        let mut tag_filters = Vec::with_capacity(filter_count as usize);
        for _ in 0..filter_count {
            let (&flags, tail) = rest
                .split_first()
                .ok_or(DecodeError::UnexpectedEnd { need: 1 })?;
            let (key, tail) = encoding::unmarshal_bytes_u16(tail)?;
            let (value, tail) = encoding::unmarshal_bytes_u16(tail)?;
            tag_filters.push(TagFilter {
                key: String::from_utf8(key.to_vec())?,
                value: String::from_utf8(value.to_vec())?,
                is_negative: flags & FLAG_NEGATIVE != 0,
                is_regexp: flags & FLAG_REGEXP != 0,
            });
            rest = tail;
        }

        if !rest.is_empty() {
            return Err(SearchQueryError::TrailingData(rest.len()));
        }

        Ok(Self {
            tenant: Tenant::new(account_id, project_id),
            time_range: TimeRange::new(min_timestamp, max_timestamp),
            tag_filters,
        })
    }
}
