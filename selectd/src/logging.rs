//! Logging setup from the CLI config.

use crate::config::Config;
use tracing_subscriber::EnvFilter;

/// Initialises the global tracing subscriber.
///
/// `-v` overrides `--log-filter`, which overrides the `info` default.
pub fn init_logging(config: &Config) {
    let directives = match config.log_verbose_count {
        0 => config
            .log_filter
            .clone()
            .unwrap_or_else(|| "info".to_owned()),
        1 => "debug,hyper=info,h2=info".to_owned(),
        _ => "trace,hyper=info,h2=info".to_owned(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .init();
}
