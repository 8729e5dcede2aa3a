//! HTTP service for the select tier.
//!
//! All tenant-scoped paths have the form `/<prefix>/<authToken>/<suffix>`
//! where the auth token is `accountID` or `accountID:projectID`.
//!
//! Every request except `/metrics` passes the process-wide admission
//! gate first: a request that cannot acquire a slot within the queue
//! duration is rejected with a capacity hint. The per-shard gates in the
//! netstorage layer are the second line of defence.

use crate::rollup_cache::RollupResultCache;
use data_types::{Tenant, TenantError};
use hyper::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use metric::{Metric, RawReporter, U64Counter, U64Gauge};
use netstorage::StorageCluster;
use observability_deps::tracing::error;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors returned by the HTTP request handler.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The requested path has no registered handler.
    #[error("not found")]
    NoHandler,

    /// The path does not follow `/<prefix>/<authToken>/<suffix>`.
    #[error("cannot parse path {path:?}: {reason}")]
    BadPath { path: String, reason: &'static str },

    /// The auth token segment is not a valid tenant.
    #[error("auth error: {0}")]
    Auth(#[from] TenantError),

    /// The service is at its concurrent request limit.
    #[error("cannot handle more than {limit} concurrent requests")]
    RequestLimit { limit: usize },

    /// A required query parameter is absent.
    #[error("missing required parameter {0:?}")]
    MissingParam(&'static str),

    /// A query parameter failed to parse.
    #[error("cannot parse parameter {name:?}: {reason}")]
    InvalidParam {
        name: &'static str,
        reason: String,
    },

    /// The query string failed to decode.
    #[error("cannot parse query string {query:?}: {source}")]
    QueryString {
        query: String,
        source: serde_urlencoded::de::Error,
    },

    /// A series selector failed to parse.
    #[error("cannot parse selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },

    /// The client disconnected or the body failed to arrive.
    #[error("cannot read request body: {0}")]
    Body(hyper::Error),

    /// One line of an import request failed to decode.
    #[error("cannot parse import line {line}: {source}")]
    ImportLine {
        line: usize,
        source: serde_json::Error,
    },

    /// The distributed query layer failed.
    #[error(transparent)]
    Query(#[from] netstorage::Error),
}

impl HttpError {
    /// The status code reported to the client on the Prometheus API
    /// read paths, which wrap errors in the JSON error envelope.
    ///
    /// Export, federate, delete and import report failures through the
    /// generic plain-text path instead, where a storage failure is a
    /// plain server error rather than a 422.
    pub fn as_status_code(&self) -> StatusCode {
        match self {
            Self::NoHandler => StatusCode::NOT_FOUND,
            Self::BadPath { .. }
            | Self::Auth(_)
            | Self::MissingParam(_)
            | Self::InvalidParam { .. }
            | Self::QueryString { .. }
            | Self::Selector { .. }
            | Self::Body(_)
            | Self::ImportLine { .. } => StatusCode::BAD_REQUEST,
            Self::RequestLimit { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Query(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

/// The parsed `/<prefix>/<authToken>/<suffix>` path form.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ParsedPath {
    pub(crate) prefix: String,
    pub(crate) auth_token: String,
    pub(crate) suffix: String,
}

impl ParsedPath {
    fn parse(path: &str) -> Result<Self, HttpError> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let mut parts = trimmed.splitn(3, '/');
        let (prefix, auth_token, suffix) = match (parts.next(), parts.next(), parts.next()) {
            (Some(prefix), Some(auth), Some(suffix))
                if !prefix.is_empty() && !auth.is_empty() && !suffix.is_empty() =>
            {
                (prefix, auth, suffix)
            }
            _ => {
                return Err(HttpError::BadPath {
                    path: path.to_owned(),
                    reason: "want /<prefix>/<authToken>/<suffix>",
                })
            }
        };
        Ok(Self {
            prefix: prefix.to_owned(),
            auth_token: auth_token.to_owned(),
            suffix: suffix.to_owned(),
        })
    }
}

/// Routes requests to the query, delete and import handlers.
#[derive(Debug)]
pub struct HttpDelegate {
    pub(crate) cluster: Arc<StorageCluster>,
    pub(crate) rollup_cache: Arc<RollupResultCache>,
    registry: Arc<metric::Registry>,
    pub(crate) max_query_duration: Duration,

    // Process-wide admission gate: the primary defence against request
    // storms.
    request_sem: Arc<Semaphore>,
    max_concurrent_requests: usize,
    max_queue_duration: Duration,

    requests: Metric<U64Counter>,
    request_errors: Metric<U64Counter>,
    requests_rejected: U64Counter,
}

impl HttpDelegate {
    pub fn new(
        cluster: Arc<StorageCluster>,
        rollup_cache: Arc<RollupResultCache>,
        registry: Arc<metric::Registry>,
        max_concurrent_requests: usize,
        max_queue_duration: Duration,
        max_query_duration: Duration,
    ) -> Self {
        let requests = registry.register_metric::<U64Counter>(
            "http_requests",
            "total number of HTTP requests accepted per path",
        );
        let request_errors = registry.register_metric::<U64Counter>(
            "http_request_errors",
            "total number of failed HTTP requests per path",
        );
        let requests_rejected = registry
            .register_metric::<U64Counter>(
                "http_requests_rejected",
                "requests rejected because the concurrent request limit was reached",
            )
            .recorder(&[]);
        registry
            .register_metric::<U64Gauge>(
                "max_concurrent_requests",
                "capacity of the request admission gate",
            )
            .recorder(&[])
            .set(max_concurrent_requests as u64);

        Self {
            cluster,
            rollup_cache,
            registry: Arc::clone(&registry),
            max_query_duration,
            request_sem: Arc::new(Semaphore::new(max_concurrent_requests)),
            max_concurrent_requests,
            max_queue_duration,
            requests,
            request_errors,
            requests_rejected,
        }
    }

    /// Routes `req`, returning the response to write.
    pub async fn route(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_owned();

        // The metrics endpoint must stay reachable even when the gate is
        // saturated.
        if req.method() == Method::GET && path == "/metrics" {
            return self.metrics_response();
        }

        // Wait for an admission slot for a short while: this absorbs
        // request bursts without letting a backlog build up.
        let acquired = tokio::time::timeout(
            self.max_queue_duration,
            Arc::clone(&self.request_sem).acquire_owned(),
        )
        .await;
        let _permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => unreachable!("admission semaphore is never closed"),
            Err(_) => {
                self.requests_rejected.inc(1);
                let err = HttpError::RequestLimit {
                    limit: self.max_concurrent_requests,
                };
                error!(%path, %err, "rejecting request");
                return generic_error_response(&err);
            }
        };

        if path == "/internal/resetRollupResultCache" {
            self.rollup_cache.reset();
            return Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Body::empty())
                .expect("valid response");
        }

        let prometheus_path = is_prometheus_read_path(&path);
        match self.route_inner(req, &path).await {
            Ok(mut resp) => {
                if prometheus_path {
                    resp.headers_mut()
                        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, "*".parse().unwrap());
                }
                resp
            }
            Err(err) => {
                if !matches!(err, HttpError::NoHandler) {
                    error!(%path, %err, "request failed");
                }
                if prometheus_path {
                    prometheus_error_response(&err)
                } else {
                    generic_error_response(&err)
                }
            }
        }
    }

    async fn route_inner(
        &self,
        req: Request<Body>,
        path: &str,
    ) -> Result<Response<Body>, HttpError> {
        let parsed = ParsedPath::parse(path)?;
        let tenant = Tenant::parse(&parsed.auth_token)?;

        match parsed.prefix.as_str() {
            "select" => self.select_handler(req, tenant, &parsed.suffix).await,
            "delete" => self.delete_handler(req, tenant, &parsed.suffix).await,
            "insert" => self.insert_handler(req, tenant, &parsed.suffix).await,
            // Not our link.
            _ => Err(HttpError::NoHandler),
        }
    }

    async fn select_handler(
        &self,
        req: Request<Body>,
        tenant: Tenant,
        suffix: &str,
    ) -> Result<Response<Body>, HttpError> {
        if let Some(rest) = suffix.strip_prefix("prometheus/api/v1/label/") {
            if let Some(label_name) = rest.strip_suffix("/values") {
                let label_name = label_name.to_owned();
                return self
                    .observe("label_values", self.handle_label_values(req, tenant, label_name))
                    .await;
            }
        }

        match suffix {
            "prometheus/api/v1/query" => self.observe("query", self.handle_query(req, tenant)).await,
            "prometheus/api/v1/query_range" => {
                self.observe("query_range", self.handle_query_range(req, tenant))
                    .await
            }
            "prometheus/api/v1/series" => {
                self.observe("series", self.handle_series(req, tenant)).await
            }
            "prometheus/api/v1/series/count" => {
                self.observe("series_count", self.handle_series_count(req, tenant))
                    .await
            }
            "prometheus/api/v1/labels" => {
                self.observe("labels", self.handle_labels(req, tenant)).await
            }
            "prometheus/api/v1/labels/count" => {
                self.observe("labels_count", self.handle_labels_count(req, tenant))
                    .await
            }
            "prometheus/api/v1/export" => {
                self.observe("export", self.handle_export(req, tenant)).await
            }
            "prometheus/federate" => {
                self.observe("federate", self.handle_federate(req, tenant))
                    .await
            }
            _ => Err(HttpError::NoHandler),
        }
    }

    async fn delete_handler(
        &self,
        req: Request<Body>,
        tenant: Tenant,
        suffix: &str,
    ) -> Result<Response<Body>, HttpError> {
        match suffix {
            "prometheus/api/v1/admin/tsdb/delete_series" => {
                self.observe("delete_series", self.handle_delete_series(req, tenant))
                    .await
            }
            _ => Err(HttpError::NoHandler),
        }
    }

    async fn insert_handler(
        &self,
        req: Request<Body>,
        tenant: Tenant,
        suffix: &str,
    ) -> Result<Response<Body>, HttpError> {
        match suffix {
            "prometheus/api/v1/import" => {
                self.observe("import", self.handle_import(req, tenant)).await
            }
            _ => Err(HttpError::NoHandler),
        }
    }

    /// Counts the request per path, and the error if the handler fails.
    async fn observe<F>(
        &self,
        path_kind: &'static str,
        fut: F,
    ) -> Result<Response<Body>, HttpError>
    where
        F: std::future::Future<Output = Result<Response<Body>, HttpError>>,
    {
        self.requests.recorder(&[("path", path_kind)]).inc(1);
        let res = fut.await;
        if res.is_err() {
            self.request_errors.recorder(&[("path", path_kind)]).inc(1);
        }
        res
    }

    fn metrics_response(&self) -> Response<Body> {
        let mut reporter = RawReporter::default();
        self.registry.report(&mut reporter);

        let mut out = String::new();
        for set in reporter.observations() {
            let type_name = match set.kind {
                metric::MetricKind::U64Counter => "counter",
                metric::MetricKind::U64Gauge => "gauge",
            };
            writeln!(out, "# HELP {} {}", set.metric_name, set.description).unwrap();
            writeln!(out, "# TYPE {} {}", set.metric_name, type_name).unwrap();
            for (attributes, observation) in &set.observations {
                let value = match observation {
                    metric::Observation::U64Counter(v) => *v,
                    metric::Observation::U64Gauge(v) => *v,
                };
                let labels = attributes
                    .iter()
                    .map(|(k, v)| format!("{k}={:?}", v.as_ref()))
                    .collect::<Vec<_>>()
                    .join(",");
                if labels.is_empty() {
                    writeln!(out, "{} {}", set.metric_name, value).unwrap();
                } else {
                    writeln!(out, "{}{{{}}} {}", set.metric_name, labels, value).unwrap();
                }
            }
        }

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(out))
            .expect("valid response")
    }
}

/// The Prometheus API read verbs: query, query_range, series,
/// series/count, labels, labels/count and label values.
///
/// These paths get CORS headers and wrap errors in the Prometheus JSON
/// error envelope (a failing query is a 422). Export, federate, delete
/// and import are excluded and report errors through the plain server
/// error path instead.
fn is_prometheus_read_path(path: &str) -> bool {
    path.starts_with("/select/")
        && path.contains("/prometheus/api/v1/")
        && !path.ends_with("/export")
}

fn prometheus_error_response(err: &HttpError) -> Response<Body> {
    let status = err.as_status_code();
    let body = serde_json::json!({
        "status": "error",
        "errorType": status.as_u16().to_string(),
        "error": err.to_string(),
    });

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(body.to_string()))
        .expect("valid response")
}

/// The default server error rendering for the non-Prometheus-API paths:
/// plain text, with storage failures reported as a server error.
fn generic_error_response(err: &HttpError) -> Response<Body> {
    let status = match err {
        HttpError::Query(_) => StatusCode::INTERNAL_SERVER_ERROR,
        other => other.as_status_code(),
    };

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(err.to_string()))
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_path_forms() {
        let p = ParsedPath::parse("/select/1:2/prometheus/api/v1/query").unwrap();
        assert_eq!(p.prefix, "select");
        assert_eq!(p.auth_token, "1:2");
        assert_eq!(p.suffix, "prometheus/api/v1/query");

        let p = ParsedPath::parse("/delete/7/prometheus/api/v1/admin/tsdb/delete_series").unwrap();
        assert_eq!(p.auth_token, "7");
    }

    #[test]
    fn parse_path_rejects_short_paths() {
        assert!(ParsedPath::parse("/select").is_err());
        assert!(ParsedPath::parse("/select/1").is_err());
        assert!(ParsedPath::parse("/").is_err());
    }

    #[test]
    fn prometheus_read_paths_cover_the_read_verbs_only() {
        assert!(is_prometheus_read_path("/select/1/prometheus/api/v1/query"));
        assert!(is_prometheus_read_path("/select/1/prometheus/api/v1/labels"));
        assert!(is_prometheus_read_path(
            "/select/1/prometheus/api/v1/label/job/values"
        ));
        assert!(!is_prometheus_read_path(
            "/select/1/prometheus/api/v1/export"
        ));
        assert!(!is_prometheus_read_path("/select/1/prometheus/federate"));
        assert!(!is_prometheus_read_path(
            "/delete/1/prometheus/api/v1/admin/tsdb/delete_series"
        ));
        assert!(!is_prometheus_read_path("/insert/1/prometheus/api/v1/import"));
    }

    #[test]
    fn generic_error_path_reports_storage_failures_as_server_errors() {
        let err = HttpError::Query(netstorage::Error::NoStorageNodes);
        assert_eq!(err.as_status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            generic_error_response(&err).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let err = HttpError::MissingParam("match[]");
        assert_eq!(
            generic_error_response(&err).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
