use crate::encoding::{self, DecodeError};
use crate::Tenant;
use thiserror::Error;

/// The label name Prometheus exposes for the metric name.
///
/// On the wire and in the router fingerprint the metric name travels as a
/// label with an empty name; the HTTP layer converts between the two.
pub const NAME_LABEL: &str = "__name__";

/// A single `(name, value)` label pair.
///
/// An empty `name` denotes the metric name itself (see [`NAME_LABEL`]).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Sorts labels into the canonical routing order: the metric-name label
/// (empty name) first, then remaining labels by name.
///
/// The router hashes labels in the order supplied, so writers must
/// canonicalize before routing or identical series will land on
/// different shards.
pub fn canonicalize_labels(labels: &mut [Label]) {
    labels.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.value.cmp(&b.value)));
}

/// A label name together with every value it takes within a tenant, as
/// returned by the `labelEntries` verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub key: String,
    pub values: Vec<String>,
}

/// Errors converting labels to/from their wire form.
#[derive(Debug, Error)]
pub enum MetricNameError {
    #[error("label {name:?} is too long: {len} bytes exceeds {max}")]
    LabelTooLong {
        name: String,
        len: usize,
        max: usize,
    },

    #[error("label data is not valid utf-8")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    #[error("cannot decode metric name: {0}")]
    Decode(#[from] DecodeError),
}

/// A fully-qualified series identity: tenant plus ordered labels.
///
/// The wire form doubles as the router fingerprint:
///
/// ```text
/// u32 accountID | u32 projectID | (u16 len | name | u16 len | value)*
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MetricName {
    pub tenant: Tenant,
    pub labels: Vec<Label>,
}

impl MetricName {
    pub fn new(tenant: Tenant, labels: Vec<Label>) -> Self {
        Self { tenant, labels }
    }

    /// Appends the wire form of this metric name to `dst`.
    pub fn marshal_raw(&self, dst: &mut Vec<u8>) -> Result<(), MetricNameError> {
        marshal_metric_name_raw(dst, self.tenant, &self.labels)
    }

    /// Decodes a metric name from its wire form, consuming all of `src`.
    pub fn unmarshal_raw(src: &[u8]) -> Result<Self, MetricNameError> {
        let (account_id, rest) = encoding::unmarshal_u32(src)?;
        let (project_id, mut rest) = encoding::unmarshal_u32(rest)?;

        let mut labels = Vec::new();
        while !rest.is_empty() {
            let (name, tail) = encoding::unmarshal_bytes_u16(rest)?;
            let (value, tail) = encoding::unmarshal_bytes_u16(tail)?;
            labels.push(Label {
                name: String::from_utf8(name.to_vec())?,
                value: String::from_utf8(value.to_vec())?,
            });
            rest = tail;
        }

        Ok(Self {
            tenant: Tenant::new(account_id, project_id),
            labels,
        })
    }
}

/// Appends the canonical `(tenant, labels)` wire form to `dst`.
///
/// This byte sequence is both the on-wire metric name and the input to
/// the router's hash.
pub fn marshal_metric_name_raw(
    dst: &mut Vec<u8>,
    tenant: Tenant,
    labels: &[Label],
) -> Result<(), MetricNameError> {
    encoding::marshal_u32(dst, tenant.account_id);
    encoding::marshal_u32(dst, tenant.project_id);
    for label in labels {
        for part in [&label.name, &label.value] {
            if part.len() > u16::MAX as usize {
                return Err(MetricNameError::LabelTooLong {
                    name: label.name.clone(),
                    len: part.len(),
                    max: u16::MAX as usize,
                });
            }
        }
        encoding::marshal_bytes_u16(dst, label.name.as_bytes());
        encoding::marshal_bytes_u16(dst, label.value.as_bytes());
    }
    Ok(())
}
