use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::Bytes;
use gch_types::{GatewayError, NetworkKind, Result};
use reqwest::header::HeaderMap;
use tracing::{info, warn};
use url::Url;

use crate::{QueryTier, RequestContext};

/// Final query accounting, sent once the query finished.
pub const CLICKHOUSE_SUMMARY_HEADER: &str = "X-Clickhouse-Summary";

/// Mid-stream accounting, same JSON shape as the summary.
pub const CLICKHOUSE_PROGRESS_HEADER: &str = "X-Clickhouse-Progress";

/// The query id the back-end actually ran under; a proxy in front of it
/// may rewrite the one we sent.
pub const CLICKHOUSE_QUERY_ID_HEADER: &str = "X-ClickHouse-Query-Id";

/// Rows and bytes the back-end reports having read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySummary {
    pub read_rows: i64,
    pub read_bytes: i64,
}

impl Default for QuerySummary {
    fn default() -> Self {
        Self {
            read_rows: -1,
            read_bytes: -1,
        }
    }
}

/// Parse the accounting header (summary or progress).
///
/// The header may appear several times as the query progresses; the last
/// value wins. A malformed value is logged and degrades to unknown
/// counts, it never fails the query.
pub fn parse_summary(headers: &HeaderMap, header_name: &str) -> QuerySummary {
    let Some(value) = headers.get_all(header_name).iter().last() else {
        return QuerySummary::default();
    };
    let Ok(text) = value.to_str() else {
        warn!(header = header_name, "accounting header is not valid UTF-8");
        return QuerySummary::default();
    };
    match serde_json::from_str::<HashMap<String, String>>(text) {
        Ok(stats) => {
            let count = |key: &str| {
                stats
                    .get(key)
                    .and_then(|value| value.parse::<i64>().ok())
                    .unwrap_or(-1)
            };
            QuerySummary {
                read_rows: count("read_rows"),
                read_bytes: count("read_bytes"),
            }
        }
        Err(err) => {
            warn!(header = header_name, raw = text, error = %err, "malformed accounting header");
            QuerySummary::default()
        }
    }
}

/// Collapse a multi-line SQL body into one log-friendly line.
pub fn format_sql(query: &str) -> String {
    query
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shorten a long SQL body for logging, keeping the head and the tail.
pub fn ellipsize_sql(query: &str) -> String {
    const LIMIT: usize = 500;
    const HEAD: usize = 395;
    const TAIL: usize = 100;
    if query.len() <= LIMIT {
        return query.to_string();
    }
    let head_end = (0..=HEAD).rev().find(|&i| query.is_char_boundary(i));
    let tail_start = (query.len() - TAIL..query.len()).find(|&i| query.is_char_boundary(i));
    match (head_end, tail_start) {
        (Some(head_end), Some(tail_start)) => {
            format!("{}<...>{}", &query[..head_end], &query[tail_start..])
        }
        _ => query.to_string(),
    }
}

/// Connection settings shared by all tiers.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub connect_timeout: Duration,
    /// Value of the `http_headers_progress_interval_ms` query parameter.
    pub progress_interval: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// What a successful back-end query returned.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub body: Bytes,
    /// The query id from the response header, falling back to the one we
    /// sent.
    pub query_id: String,
    pub summary: QuerySummary,
}

/// HTTP access to the analytic back-end.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    progress_interval: Duration,
}

impl BackendClient {
    pub fn new(options: BackendOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|err| GatewayError::Network {
                kind: NetworkKind::Other,
                detail: err.to_string(),
            })?;
        Ok(Self {
            http,
            progress_interval: options.progress_interval,
        })
    }

    /// The tier endpoint with the per-query parameters attached.
    pub fn query_url(&self, endpoint: &Url, query_id: &str) -> Url {
        let mut url = endpoint.clone();
        url.query_pairs_mut()
            .append_pair("query_id", query_id)
            .append_pair("send_progress_in_http_headers", "1")
            .append_pair(
                "http_headers_progress_interval_ms",
                &self.progress_interval.as_millis().to_string(),
            );
        url
    }

    /// POST the query body to the tier's endpoint.
    pub async fn post_query(
        &self,
        ctx: &RequestContext,
        tier: &QueryTier,
        sql: impl Into<String>,
    ) -> Result<BackendResponse> {
        let sql = sql.into();
        let sent_query_id = ctx.backend_query_id();
        let url = self.query_url(&tier.endpoint, &sent_query_id);
        let started = Instant::now();

        let send = self
            .http
            .post(url)
            .timeout(tier.total_timeout)
            .body(sql.clone())
            .send();
        let response = tokio::select! {
            biased;
            _ = ctx.cancel().cancelled() => return Err(GatewayError::Canceled),
            response = send => response.map_err(|err| classify_transport(&err))?,
        };

        let query_id = response
            .headers()
            .get(CLICKHOUSE_QUERY_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(&sent_query_id)
            .to_string();
        let summary = parse_summary(response.headers(), CLICKHOUSE_SUMMARY_HEADER);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::backend(status.as_u16(), body));
        }

        let body = tokio::select! {
            biased;
            _ = ctx.cancel().cancelled() => return Err(GatewayError::Canceled),
            body = response.bytes() => body.map_err(|err| classify_transport(&err))?,
        };

        info!(
            query = %ellipsize_sql(&format_sql(&sql)),
            query_id = %query_id,
            read_rows = summary.read_rows,
            read_bytes = summary.read_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query"
        );
        Ok(BackendResponse {
            body,
            query_id,
            summary,
        })
    }
}

fn classify_transport(err: &reqwest::Error) -> GatewayError {
    let detail = err_chain(err);
    let lowered = detail.to_lowercase();
    let kind = if err.is_timeout() {
        NetworkKind::Timeout
    } else if lowered.contains("dns error") || lowered.contains("no route to host") {
        NetworkKind::Route
    } else if err.is_connect()
        || lowered.contains("connection refused")
        || lowered.contains("connection reset")
    {
        NetworkKind::Connect
    } else {
        NetworkKind::Other
    };
    GatewayError::Network { kind, detail }
}

/// Flatten an error and its sources into one line; reqwest's top-level
/// message alone rarely names the cause.
fn err_chain(err: &dyn std::error::Error) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}
