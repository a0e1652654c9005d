// main.rs

use std::sync::{Arc, RwLock};

use clap::Parser;
use tokio::runtime;
use tracing::{info, instrument};
use tracing_subscriber::{layer::SubscriberExt, Layer};

mod args;
mod handlers;
mod router;
mod services;
mod types;

use services::policy::SmoothSignals;
use services::prefetch::Prefetcher;
use services::presentation::PresentationRegistry;
use services::throughput::ThroughputRegistry;
use types::{AppState, PolicySnapshot};

#[instrument(skip_all)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let args = args::Args::parse();

    // Build the FmtSubscriber layer
    let fmt_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_filter(args.log_level);

    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");

    info!("{:?}", args);

    // The upstream must be an absolute URL; everything we serve maps onto it.
    let upstream = reqwest::Url::parse(&args.upstream_gateway_url)?;
    let addr: std::net::SocketAddr = args.listen_address.parse()?;

    let runtime = runtime::Builder::new_multi_thread()
        .thread_name_fn(|| {
            static ATOMIC_WORKER_ID: std::sync::atomic::AtomicUsize =
                std::sync::atomic::AtomicUsize::new(0);
            let id = ATOMIC_WORKER_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("PROXY w-{}", id)
        })
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async move {
        let http = reqwest::Client::new();

        // One long-running consumer serializes all prefetch traffic
        let prefetcher = Prefetcher::spawn(http.clone(), args.prefetch_queue_drain);

        let state = AppState {
            upstream,
            http,
            presentations: Arc::new(PresentationRegistry::new()),
            clients: Arc::new(ThroughputRegistry::new()),
            prefetcher,
            policy: Arc::new(RwLock::new(PolicySnapshot::default())),
            signals: Arc::new(RwLock::new(SmoothSignals::default())),
        };

        let app = router::create_router(state);

        let sock = socket2::Socket::new(
            match addr {
                std::net::SocketAddr::V4(_) => socket2::Domain::IPV4,
                std::net::SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM, // Will become SOCK_CLOEXEC internally on Linux
            None,
        )
        .unwrap();

        sock.set_reuse_address(true).unwrap();
        #[cfg(unix)]
        sock.set_reuse_port(true).unwrap();
        sock.set_nonblocking(true).unwrap();
        sock.bind(&addr.into()).unwrap();
        sock.listen(1024).unwrap();

        let listener = tokio::net::TcpListener::from_std(sock.into()).unwrap();

        info!(
            "proxying {} from {}",
            args.upstream_gateway_url, args.listen_address
        );
        axum::serve(listener, app).await.unwrap();
    });

    Ok(())
}
