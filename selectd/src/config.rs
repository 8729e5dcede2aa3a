//! CLI config for the select tier daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// CLI config for the select tier daemon.
#[derive(Debug, Clone, clap::Parser)]
#[clap(
    name = "selectd",
    about = "Query-side coordinator for the sharded time-series store"
)]
pub struct Config {
    /// Address to listen on for HTTP requests.
    ///
    /// A bare `:port` binds all interfaces.
    #[clap(
        long = "http-listen-addr",
        env = "SELECTD_HTTP_LISTEN_ADDR",
        default_value = ":8481",
        value_parser = parse_listen_addr
    )]
    pub http_listen_addr: SocketAddr,

    /// Path to the directory for cache files (query spill files and the
    /// rollup result cache). Caches are not saved when unset.
    #[clap(long = "cache-data-path", env = "SELECTD_CACHE_DATA_PATH")]
    pub cache_data_path: Option<PathBuf>,

    /// The maximum number of concurrent search requests.
    ///
    /// It shouldn't exceed 2x the number of vCPUs for better
    /// performance. See also --search-max-queue-duration.
    #[clap(
        long = "search-max-concurrent-requests",
        env = "SELECTD_SEARCH_MAX_CONCURRENT_REQUESTS",
        default_value_t = 2 * num_cpus::get()
    )]
    pub max_concurrent_requests: usize,

    /// The maximum time a request waits for execution when the
    /// --search-max-concurrent-requests limit is reached.
    #[clap(
        long = "search-max-queue-duration",
        env = "SELECTD_SEARCH_MAX_QUEUE_DURATION",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub max_queue_duration: Duration,

    /// The maximum duration of a single query. Individual requests may
    /// lower it with a `timeout` query parameter.
    #[clap(
        long = "search-max-query-duration",
        env = "SELECTD_SEARCH_MAX_QUERY_DURATION",
        default_value = "30s",
        value_parser = parse_duration
    )]
    pub max_query_duration: Duration,

    /// Address of a storage node; repeat the flag for each node. At
    /// least one is required.
    ///
    /// The order of the flags is the routing order: changing it moves
    /// series between shards.
    #[clap(long = "storage-node", required = true, num_args = 1, action = clap::ArgAction::Append)]
    pub storage_nodes: Vec<String>,

    /// Logs: filter directive, e.g. `info` or `debug,hyper=info`.
    #[clap(long = "log-filter", env = "LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand; `-v` means debug, `-vv` means trace.
    /// Overrides --log-filter.
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub log_verbose_count: u8,
}

/// Accepts `host:port` or the `:port` short form.
fn parse_listen_addr(input: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    if let Some(port_only) = input.strip_prefix(':') {
        return format!("0.0.0.0:{port_only}").parse();
    }
    input.parse()
}

/// Parses durations of the form `300ms`, `10s`, `5m` or `1h`.
fn parse_duration(input: &str) -> Result<Duration, String> {
    let (value, unit) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => input.split_at(idx),
        None => (input, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit {unit:?} in {input:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_minimal_command_line() {
        let config = Config::parse_from(["selectd", "--storage-node", "127.0.0.1:8401"]);
        assert_eq!(config.http_listen_addr.port(), 8481);
        assert_eq!(config.storage_nodes, vec!["127.0.0.1:8401"]);
        assert_eq!(config.max_queue_duration, Duration::from_secs(10));
        assert_eq!(config.max_query_duration, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_requests, 2 * num_cpus::get());
    }

    #[test]
    fn storage_node_flag_repeats() {
        let config = Config::parse_from([
            "selectd",
            "--storage-node",
            "a:1",
            "--storage-node",
            "b:2",
        ]);
        assert_eq!(config.storage_nodes, vec!["a:1", "b:2"]);
    }

    #[test]
    fn storage_node_flag_is_required() {
        assert!(Config::try_parse_from(["selectd"]).is_err());
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn listen_addr_short_form() {
        let addr = parse_listen_addr(":9000").unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.ip().is_unspecified());
    }
}
