//! CLI config for the analytic back-end connection.

use std::time::Duration;

use gch_query::BackendOptions;
use url::Url;

/// CLI config for the analytic back-end connection.
#[derive(Debug, Clone, clap::Parser)]
pub struct BackendConfig {
    /// Default back-end URL; duration tiers may override it.
    #[clap(
        long = "clickhouse-url",
        env = "GCH_CLICKHOUSE_URL",
        default_value = "http://localhost:8123/?cancel_http_readonly_queries_on_client_close=1",
        action
    )]
    pub url: Url,

    /// Default total timeout to fetch data; tiers may override it.
    #[clap(
        long = "clickhouse-data-timeout",
        env = "GCH_CLICKHOUSE_DATA_TIMEOUT",
        default_value = "1m",
        value_parser = humantime::parse_duration,
        action
    )]
    pub data_timeout: Duration,

    /// Total timeout to fetch the series list from the index.
    #[clap(
        long = "clickhouse-index-timeout",
        env = "GCH_CLICKHOUSE_INDEX_TIMEOUT",
        default_value = "1m",
        value_parser = humantime::parse_duration,
        action
    )]
    pub index_timeout: Duration,

    /// TCP connection timeout.
    #[clap(
        long = "clickhouse-connect-timeout",
        env = "GCH_CLICKHOUSE_CONNECT_TIMEOUT",
        default_value = "1s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub connect_timeout: Duration,

    /// Interval at which the back-end reports progress headers.
    #[clap(
        long = "clickhouse-progress-interval",
        env = "GCH_CLICKHOUSE_PROGRESS_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub progress_interval: Duration,
}

impl BackendConfig {
    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            connect_timeout: self.connect_timeout,
            progress_interval: self.progress_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::try_parse_from(["program"]).unwrap();
        assert_eq!(config.url.scheme(), "http");
        assert_eq!(config.data_timeout, Duration::from_secs(60));
        assert_eq!(config.index_timeout, Duration::from_secs(60));
        assert_eq!(
            config.backend_options().connect_timeout,
            Duration::from_secs(1)
        );
    }
}
