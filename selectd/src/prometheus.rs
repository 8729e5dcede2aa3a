//! Prometheus API handlers.
//!
//! The query endpoints evaluate plain series selectors (metric name plus
//! label matchers) against the merged series returned by the storage
//! layer; full query-language evaluation is a separate concern layered
//! on top of this tier.

use crate::http::{HttpDelegate, HttpError};
use data_types::{
    canonicalize_labels, Deadline, Label, MetricName, SearchQuery, TagFilter, TimeRange,
    NAME_LABEL,
};
use data_types::Tenant;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request, Response, StatusCode};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Instant queries and federation look back this far for the latest
/// sample of each series.
const DEFAULT_LOOKBACK: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize)]
struct QueryParams {
    query: String,
    time: Option<String>,
    timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryRangeParams {
    query: String,
    start: String,
    end: Option<String>,
    step: Option<String>,
    timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatchParams {
    #[serde(rename = "match[]")]
    matcher: Option<String>,
    start: Option<String>,
    end: Option<String>,
    timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlainParams {
    timeout: Option<String>,
}

/// One merged series with its labels rendered for JSON output.
#[derive(Debug)]
struct CollectedSeries {
    labels: BTreeMap<String, String>,
    timestamps: Vec<i64>,
    values: Vec<f64>,
}

impl HttpDelegate {
    pub(crate) async fn handle_query(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        let params: QueryParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let filters = parse_metric_selector(&params.query)?;

        let time = match &params.time {
            Some(time) => parse_time_param("time", time)?,
            None => now_ms(),
        };
        let range = TimeRange::new(time - DEFAULT_LOOKBACK.as_millis() as i64, time);
        let (series, is_partial) = self.collect_series(tenant, filters, range, deadline).await?;

        // An instant vector: the latest sample of each series within the
        // lookback window, reported at the evaluation timestamp.
        let result: Vec<serde_json::Value> = series
            .iter()
            .filter_map(|s| {
                s.values.last().map(|value| {
                    serde_json::json!({
                        "metric": s.labels,
                        "value": [seconds(time), value.to_string()],
                    })
                })
            })
            .collect();

        Ok(json_response(serde_json::json!({
            "status": "success",
            "isPartial": is_partial,
            "data": {"resultType": "vector", "result": result},
        })))
    }

    pub(crate) async fn handle_query_range(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        let params: QueryRangeParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let filters = parse_metric_selector(&params.query)?;

        let start = parse_time_param("start", &params.start)?;
        let end = match &params.end {
            Some(end) => parse_time_param("end", end)?,
            None => now_ms(),
        };
        let step = match &params.step {
            Some(step) => parse_duration_param("step", step)?,
            None => Duration::from_secs(15),
        };

        // Samples are returned at their native resolution; the step still
        // distinguishes cache entries so clients with different steps do
        // not share responses.
        let cache_key = format!(
            "{tenant}|{}|{start}|{end}|{}",
            params.query,
            step.as_millis()
        );
        if let Some(cached) = self.rollup_cache.get(&cache_key) {
            return Ok(json_bytes_response(cached));
        }

        let range = TimeRange::new(start, end);
        let (series, is_partial) = self.collect_series(tenant, filters, range, deadline).await?;

        let result: Vec<serde_json::Value> = series
            .iter()
            .map(|s| {
                let values: Vec<serde_json::Value> = s
                    .timestamps
                    .iter()
                    .zip(&s.values)
                    .map(|(ts, v)| serde_json::json!([seconds(*ts), v.to_string()]))
                    .collect();
                serde_json::json!({"metric": s.labels, "values": values})
            })
            .collect();

        let body = serde_json::json!({
            "status": "success",
            "isPartial": is_partial,
            "data": {"resultType": "matrix", "result": result},
        })
        .to_string();

        // Partial answers must not poison later complete ones.
        if !is_partial {
            self.rollup_cache
                .put(cache_key, body.clone().into_bytes());
        }
        Ok(json_bytes_response(body.into_bytes()))
    }

    pub(crate) async fn handle_series(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        let params: MatchParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let matcher = params.matcher.ok_or(HttpError::MissingParam("match[]"))?;
        let filters = parse_metric_selector(&matcher)?;

        let end = match &params.end {
            Some(end) => parse_time_param("end", end)?,
            None => now_ms(),
        };
        let start = match &params.start {
            Some(start) => parse_time_param("start", start)?,
            None => end - DEFAULT_LOOKBACK.as_millis() as i64,
        };

        let range = TimeRange::new(start, end);
        let (series, is_partial) = self.collect_series(tenant, filters, range, deadline).await?;
        let data: Vec<_> = series.iter().map(|s| &s.labels).collect();

        Ok(json_response(serde_json::json!({
            "status": "success",
            "isPartial": is_partial,
            "data": data,
        })))
    }

    pub(crate) async fn handle_series_count(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        let params: PlainParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let (count, is_partial) = self.cluster.get_series_count(tenant, deadline).await?;

        Ok(json_response(serde_json::json!({
            "status": "success",
            "isPartial": is_partial,
            "data": count,
        })))
    }

    pub(crate) async fn handle_labels(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        let params: PlainParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let (labels, is_partial) = self.cluster.get_labels(tenant, deadline).await?;

        Ok(json_response(serde_json::json!({
            "status": "success",
            "isPartial": is_partial,
            "data": labels,
        })))
    }

    pub(crate) async fn handle_labels_count(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        let params: PlainParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let (entries, is_partial) = self.cluster.get_label_entries(tenant, deadline).await?;

        let data: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| serde_json::json!({"name": e.key, "count": e.values.len()}))
            .collect();

        Ok(json_response(serde_json::json!({
            "status": "success",
            "isPartial": is_partial,
            "data": data,
        })))
    }

    pub(crate) async fn handle_label_values(
        &self,
        req: Request<Body>,
        tenant: Tenant,
        label_name: String,
    ) -> Result<Response<Body>, HttpError> {
        let params: PlainParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let (values, is_partial) = self
            .cluster
            .get_label_values(tenant, &label_name, deadline)
            .await?;

        Ok(json_response(serde_json::json!({
            "status": "success",
            "isPartial": is_partial,
            "data": values,
        })))
    }

    pub(crate) async fn handle_export(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        let params: MatchParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let matcher = params.matcher.ok_or(HttpError::MissingParam("match[]"))?;
        let filters = parse_metric_selector(&matcher)?;

        let end = match &params.end {
            Some(end) => parse_time_param("end", end)?,
            None => now_ms(),
        };
        let start = match &params.start {
            Some(start) => parse_time_param("start", start)?,
            None => 0,
        };

        let range = TimeRange::new(start, end);
        let (series, _) = self.collect_series(tenant, filters, range, deadline).await?;

        let mut out = String::new();
        for s in &series {
            let line = serde_json::json!({
                "metric": s.labels,
                "values": s.values,
                "timestamps": s.timestamps,
            });
            writeln!(out, "{line}").unwrap();
        }

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/stream+json")
            .body(Body::from(out))
            .expect("valid response"))
    }

    pub(crate) async fn handle_federate(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        let params: MatchParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let matcher = params.matcher.ok_or(HttpError::MissingParam("match[]"))?;
        let filters = parse_metric_selector(&matcher)?;

        let end = now_ms();
        let range = TimeRange::new(end - DEFAULT_LOOKBACK.as_millis() as i64, end);
        let (series, _) = self.collect_series(tenant, filters, range, deadline).await?;

        let mut out = String::new();
        for s in &series {
            let (Some(ts), Some(value)) = (s.timestamps.last(), s.values.last()) else {
                continue;
            };
            let name = s.labels.get(NAME_LABEL).cloned().unwrap_or_default();
            let labels = s
                .labels
                .iter()
                .filter(|(k, _)| k.as_str() != NAME_LABEL)
                .map(|(k, v)| format!("{k}={v:?}"))
                .collect::<Vec<_>>()
                .join(",");
            if labels.is_empty() {
                writeln!(out, "{name} {value} {ts}").unwrap();
            } else {
                writeln!(out, "{name}{{{labels}}} {value} {ts}").unwrap();
            }
        }

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(out))
            .expect("valid response"))
    }

    pub(crate) async fn handle_delete_series(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        let params: MatchParams = decode_params(&req)?;
        let deadline = self.request_deadline(params.timeout.as_deref())?;
        let matcher = params.matcher.ok_or(HttpError::MissingParam("match[]"))?;
        let filters = parse_metric_selector(&matcher)?;

        // Deletion covers the whole retention, not a time slice.
        let sq = SearchQuery::new(tenant, TimeRange::new(i64::MIN, i64::MAX), filters);
        self.cluster.delete_series(&sq, deadline).await?;

        Ok(no_content())
    }

    pub(crate) async fn handle_import(
        &self,
        req: Request<Body>,
        tenant: Tenant,
    ) -> Result<Response<Body>, HttpError> {
        #[derive(Debug, Deserialize)]
        struct ImportLine {
            metric: BTreeMap<String, String>,
            values: Vec<f64>,
            timestamps: Vec<i64>,
        }

        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(HttpError::Body)?;
        let text = String::from_utf8_lossy(&body);

        let mut ctx = self.cluster.insert_ctx();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ImportLine =
                serde_json::from_str(line).map_err(|source| HttpError::ImportLine {
                    line: idx + 1,
                    source,
                })?;

            let mut labels: Vec<Label> = parsed
                .metric
                .into_iter()
                .map(|(name, value)| {
                    // The metric name travels as the empty label.
                    let name = if name == NAME_LABEL { String::new() } else { name };
                    Label { name, value }
                })
                .collect();
            canonicalize_labels(&mut labels);

            ctx.labels.clear();
            for label in labels {
                ctx.add_label(label.name, label.value);
            }
            for (ts, value) in parsed.timestamps.iter().zip(&parsed.values) {
                ctx.write_data_point(tenant, *ts, *value).await?;
            }
        }
        ctx.flush_bufs().await?;

        Ok(no_content())
    }

    /// The deadline for a read request: the configured maximum, lowered
    /// by the request's own `timeout` parameter if given.
    fn request_deadline(&self, timeout: Option<&str>) -> Result<Deadline, HttpError> {
        let mut timeout_duration = self.max_query_duration;
        if let Some(timeout) = timeout {
            let requested = parse_duration_param("timeout", timeout)?;
            timeout_duration = timeout_duration.min(requested);
        }
        Ok(Deadline::new(timeout_duration))
    }

    /// Fans the search out, merges every matched series and returns them
    /// sorted by labels for deterministic responses.
    async fn collect_series(
        &self,
        tenant: Tenant,
        filters: Vec<TagFilter>,
        range: TimeRange,
        deadline: Deadline,
    ) -> Result<(Vec<CollectedSeries>, bool), HttpError> {
        let sq = SearchQuery::new(tenant, range, filters);
        let (results, is_partial) = self.cluster.process_search_query(&sq, deadline).await?;

        let collected = Mutex::new(Vec::new());
        results
            .run_parallel(|series| {
                collected.lock().push(CollectedSeries {
                    labels: labels_map(&series.metric_name),
                    timestamps: series.timestamps.clone(),
                    values: series.values.clone(),
                });
            })
            .await?;

        let mut series = collected.into_inner();
        series.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok((series, is_partial))
    }
}

fn labels_map(metric_name: &MetricName) -> BTreeMap<String, String> {
    metric_name
        .labels
        .iter()
        .map(|label| {
            let name = if label.name.is_empty() {
                NAME_LABEL.to_owned()
            } else {
                label.name.clone()
            };
            (name, label.value.clone())
        })
        .collect()
}

fn decode_params<T: DeserializeOwned>(req: &Request<Body>) -> Result<T, HttpError> {
    let query = req.uri().query().unwrap_or("");
    serde_urlencoded::from_str(query).map_err(|source| HttpError::QueryString {
        query: query.to_owned(),
        source,
    })
}

fn json_response(value: serde_json::Value) -> Response<Body> {
    json_bytes_response(value.to_string().into_bytes())
}

fn json_bytes_response(body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("valid response")
}

fn no_content() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .expect("valid response")
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the unix epoch")
        .as_millis() as i64
}

fn seconds(ts_ms: i64) -> f64 {
    ts_ms as f64 / 1000.0
}

/// Parses a timestamp parameter given as unix seconds (possibly
/// fractional) into milliseconds.
fn parse_time_param(name: &'static str, value: &str) -> Result<i64, HttpError> {
    let secs: f64 = value.parse().map_err(|_| HttpError::InvalidParam {
        name,
        reason: format!("{value:?} is not a unix timestamp"),
    })?;
    Ok((secs * 1000.0).round() as i64)
}

/// Parses a duration parameter given as seconds (possibly fractional)
/// or with an `ms`/`s`/`m`/`h` suffix.
fn parse_duration_param(name: &'static str, value: &str) -> Result<Duration, HttpError> {
    let err = |reason: String| HttpError::InvalidParam { name, reason };

    if let Ok(secs) = value.parse::<f64>() {
        if secs < 0.0 {
            return Err(err(format!("{value:?} is negative")));
        }
        return Ok(Duration::from_secs_f64(secs));
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| err(format!("{value:?} is not a duration")))?;
    let (num, unit) = value.split_at(split);
    let num: f64 = num
        .parse()
        .map_err(|_| err(format!("{value:?} is not a duration")))?;
    let base = match unit {
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(3600),
        _ => return Err(err(format!("unknown duration unit {unit:?}"))),
    };
    Ok(base.mul_f64(num))
}

/// Parses a plain series selector: `name`, `name{matchers}` or
/// `{matchers}` with `=`, `!=`, `=~` and `!~` operators.
fn parse_metric_selector(selector: &str) -> Result<Vec<TagFilter>, HttpError> {
    let err = |reason: &str| HttpError::Selector {
        selector: selector.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = selector.trim();
    let (name, matchers) = match trimmed.find('{') {
        Some(idx) => {
            let (name, rest) = trimmed.split_at(idx);
            let inner = rest
                .strip_prefix('{')
                .and_then(|r| r.strip_suffix('}'))
                .ok_or_else(|| err("unbalanced braces"))?;
            (name.trim(), Some(inner))
        }
        None => (trimmed, None),
    };

    let mut filters = Vec::new();
    if !name.is_empty() {
        filters.push(TagFilter {
            key: String::new(),
            value: name.to_owned(),
            is_negative: false,
            is_regexp: false,
        });
    }

    let Some(matchers) = matchers else {
        if filters.is_empty() {
            return Err(err("empty selector"));
        }
        return Ok(filters);
    };

    let mut chars = matchers.chars().peekable();
    loop {
        // Skip whitespace and trailing commas between matchers.
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut label = String::new();
        while matches!(chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
            label.push(chars.next().unwrap());
        }
        if label.is_empty() {
            return Err(err("expected a label name"));
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let (is_negative, is_regexp) = match chars.next() {
            Some('=') => match chars.peek() {
                Some('~') => {
                    chars.next();
                    (false, true)
                }
                _ => (false, false),
            },
            Some('!') => match chars.next() {
                Some('=') => (true, false),
                Some('~') => (true, true),
                _ => return Err(err("expected != or !~")),
            },
            _ => return Err(err("expected a match operator")),
        };

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('"') {
            return Err(err("expected a quoted value"));
        }
        let mut value = String::new();
        loop {
            match chars.next() {
                Some('\\') => match chars.next() {
                    Some(c) => value.push(c),
                    None => return Err(err("unterminated escape")),
                },
                Some('"') => break,
                Some(c) => value.push(c),
                None => return Err(err("unterminated value")),
            }
        }

        let key = if label == NAME_LABEL {
            String::new()
        } else {
            label
        };
        filters.push(TagFilter {
            key,
            value,
            is_negative,
            is_regexp,
        });
    }

    if filters.is_empty() {
        return Err(err("empty selector"));
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn selector_with_name_only() {
        let filters = parse_metric_selector("http_requests_total").unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].key, "");
        assert_eq!(filters[0].value, "http_requests_total");
        assert!(!filters[0].is_negative);
        assert!(!filters[0].is_regexp);
    }

    #[test]
    fn selector_with_matchers() {
        let filters =
            parse_metric_selector(r#"m{job="api", zone!="us", pod=~"web-.*", env!~"dev|ci"}"#)
                .unwrap();
        assert_eq!(filters.len(), 5);
        assert_eq!(filters[1].key, "job");
        assert_eq!(filters[1].value, "api");
        assert!(filters[2].is_negative && !filters[2].is_regexp);
        assert!(!filters[3].is_negative && filters[3].is_regexp);
        assert!(filters[4].is_negative && filters[4].is_regexp);
    }

    #[test]
    fn selector_name_matcher_maps_to_empty_key() {
        let filters = parse_metric_selector(r#"{__name__="m"}"#).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].key, "");
        assert_eq!(filters[0].value, "m");
    }

    #[test]
    fn selector_with_escaped_quotes() {
        let filters = parse_metric_selector(r#"{label="a\"b"}"#).unwrap();
        assert_eq!(filters[0].value, "a\"b");
    }

    #[test]
    fn selector_rejects_garbage() {
        assert_matches!(
            parse_metric_selector(""),
            Err(HttpError::Selector { .. })
        );
        assert_matches!(
            parse_metric_selector("{}"),
            Err(HttpError::Selector { .. })
        );
        assert_matches!(
            parse_metric_selector("m{job=api}"),
            Err(HttpError::Selector { .. })
        );
        assert_matches!(
            parse_metric_selector(r#"m{job="api""#),
            Err(HttpError::Selector { .. })
        );
    }

    #[test]
    fn time_and_duration_params() {
        assert_eq!(parse_time_param("t", "1.5").unwrap(), 1500);
        assert_eq!(parse_time_param("t", "100").unwrap(), 100_000);
        assert!(parse_time_param("t", "noon").is_err());

        assert_eq!(
            parse_duration_param("timeout", "1.5").unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(
            parse_duration_param("timeout", "300ms").unwrap(),
            Duration::from_millis(300)
        );
        assert_eq!(
            parse_duration_param("step", "5m").unwrap(),
            Duration::from_secs(300)
        );
        assert!(parse_duration_param("timeout", "-1").is_err());
    }
}
