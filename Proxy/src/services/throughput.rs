// services/throughput.rs

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tracing::{debug, instrument};

/// EWMA smoothing factor shared by all three estimates.
pub const DELTA_RATE: f64 = 0.50;

/// Responses smaller than this are ignored so init segments and manifests do
/// not pollute the estimates.
pub const MIN_SAMPLE_BYTES: usize = 400_000;

const INITIAL_CACHED_BPS: f64 = 15.0 * 1000.0 * 1000.0;
const INITIAL_UNCACHED_BPS: f64 = 10.0 * 1000.0 * 1000.0;

/// Per-client throughput state. `cached` and `uncached` track the two
/// transfer populations separately; `cache_hist` holds one 1.0/0.0 sample
/// per classified response, full history.
#[derive(Debug, Clone)]
pub struct ClientThroughput {
    pub cached: f64,
    pub uncached: f64,
    pub current: f64,
    pub cache_hist: Vec<f64>,
}

impl Default for ClientThroughput {
    fn default() -> Self {
        Self {
            cached: INITIAL_CACHED_BPS,
            uncached: INITIAL_UNCACHED_BPS,
            current: 0.0,
            cache_hist: Vec::new(),
        }
    }
}

/// What a completed transfer told us, derived from the post-update state.
#[derive(Debug, Clone, Copy)]
pub struct TransferObservation {
    pub current_bps: f64,
    /// The observed throughput sits closer to the cached estimate than to
    /// the uncached one.
    pub requested_high_quality: bool,
    pub cache_smooth_ratio: f64,
    pub uncache_smooth_ratio: f64,
}

/// Process-wide client map. Entries are created lazily and never evicted;
/// readers clone a self-consistent snapshot under the read lock.
#[derive(Debug, Default)]
pub struct ThroughputRegistry {
    clients: RwLock<HashMap<String, ClientThroughput>>,
}

impl ThroughputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&self, client: &str) {
        if self.clients.read().unwrap().contains_key(client) {
            return;
        }
        self.clients
            .write()
            .unwrap()
            .entry(client.to_string())
            .or_default();
    }

    pub fn snapshot(&self, client: &str) -> ClientThroughput {
        self.clients
            .read()
            .unwrap()
            .get(client)
            .cloned()
            .unwrap_or_default()
    }

    /// Fold one completed transfer into the client's estimates and classify
    /// it. `cached` is the ledger's verdict for the URL that was served.
    #[instrument(skip_all)]
    pub fn update(
        &self,
        client: &str,
        bytes: usize,
        elapsed: Duration,
        cached: bool,
    ) -> TransferObservation {
        let cur_bw = (bytes as f64 * 8.0) / elapsed.as_secs_f64();

        let mut clients = self.clients.write().unwrap();
        let ct = clients.entry(client.to_string()).or_default();

        if cached {
            ct.cached = DELTA_RATE * ct.cached + (1.0 - DELTA_RATE) * cur_bw;
            ct.cache_hist.push(1.0);
            debug!("update cached throughput {} kbits", (ct.cached / 1000.0) as i64);
        } else {
            ct.uncached = DELTA_RATE * ct.uncached + (1.0 - DELTA_RATE) * cur_bw;
            ct.cache_hist.push(0.0);
            debug!(
                "update uncached throughput {} kbits",
                (ct.uncached / 1000.0) as i64
            );
        }
        ct.current = DELTA_RATE * ct.current + (1.0 - DELTA_RATE) * cur_bw;

        let requested_high_quality = (cur_bw - ct.cached).abs() < (cur_bw - ct.uncached).abs();
        let mid = (ct.cached + ct.uncached) / 2.0;

        TransferObservation {
            current_bps: cur_bw,
            requested_high_quality,
            cache_smooth_ratio: (cur_bw - mid) / (ct.cached - mid),
            uncache_smooth_ratio: (cur_bw - ct.uncached) / (mid - ct.uncached),
        }
    }
}
