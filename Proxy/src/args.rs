// args.rs

use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Cache-aware MPEG-DASH reverse proxy for a content-addressed gateway")]
pub struct Args {
    /// Absolute URL of the upstream gateway, e.g. http://127.0.0.1:8080
    pub upstream_gateway_url: String,
    /// host:port address to listen on, e.g. 0.0.0.0:3000
    pub listen_address: String,
    /// Set the log level (possible values: error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    pub log_level: LevelFilter,
    /// Drop queued prefetches whenever one prefetch overruns a segment duration
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub prefetch_queue_drain: bool,
}
