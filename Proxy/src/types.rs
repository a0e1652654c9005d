use std::sync::{Arc, RwLock};

use crate::services::policy::{Policy, SmoothSignals};
use crate::services::prefetch::Prefetcher;
use crate::services::presentation::PresentationRegistry;
use crate::services::throughput::ThroughputRegistry;

/// Process-wide policy flags. Written whole by the settings endpoint and by
/// the post-transfer classifier; readers clone the snapshot.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub setup_mode: bool,
    pub policy: Policy,
    pub prefetch_off: bool,
    pub requested_high_quality: bool,
}

#[derive(Clone)]
pub struct AppState {
    /// The single upstream gateway all traffic is proxied to.
    pub upstream: reqwest::Url,
    pub http: reqwest::Client,
    pub presentations: Arc<PresentationRegistry>,
    pub clients: Arc<ThroughputRegistry>,
    pub prefetcher: Arc<Prefetcher>,
    pub policy: Arc<RwLock<PolicySnapshot>>,
    pub signals: Arc<RwLock<SmoothSignals>>,
}
