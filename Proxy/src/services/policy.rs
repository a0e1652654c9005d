// services/policy.rs

use tracing::debug;

use crate::services::presentation::Rendition;
use crate::services::throughput::ClientThroughput;

/// Manifest bandwidth rewrite policy. The DYNAMIC variants are aliases that
/// resolve to a concrete policy per rewrite based on the last transfer
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    #[default]
    Unchange,
    Baseline,
    CacheBased,
    UncacheBased,
    CacheBasedSmooth,
    UncacheBasedSmooth,
    Uniform,
    Dynamic,
    DynamicSmooth,
    DynamicBackendSpeed,
}

impl Policy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "UNCHANGE" => Some(Policy::Unchange),
            "BASELINE" => Some(Policy::Baseline),
            "CACHEBASED" => Some(Policy::CacheBased),
            "UNCACHEBASED" => Some(Policy::UncacheBased),
            "CACHEBASED-SMOOTH" => Some(Policy::CacheBasedSmooth),
            "UNCACHEBASED-SMOOTH" => Some(Policy::UncacheBasedSmooth),
            "UNIFORM" => Some(Policy::Uniform),
            "DYNAMIC" => Some(Policy::Dynamic),
            "DYNAMIC-SMOOTH" => Some(Policy::DynamicSmooth),
            "DYNAMIC-BACKENDSPEED" => Some(Policy::DynamicBackendSpeed),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Policy::Unchange => "UNCHANGE",
            Policy::Baseline => "BASELINE",
            Policy::CacheBased => "CACHEBASED",
            Policy::UncacheBased => "UNCACHEBASED",
            Policy::CacheBasedSmooth => "CACHEBASED-SMOOTH",
            Policy::UncacheBasedSmooth => "UNCACHEBASED-SMOOTH",
            Policy::Uniform => "UNIFORM",
            Policy::Dynamic => "DYNAMIC",
            Policy::DynamicSmooth => "DYNAMIC-SMOOTH",
            Policy::DynamicBackendSpeed => "DYNAMIC-BACKENDSPEED",
        }
    }

    /// Collapse the DYNAMIC aliases. The BACKENDSPEED pairing is
    /// intentionally asymmetric.
    pub fn resolve(self, requested_high_quality: bool) -> Self {
        match self {
            Policy::Dynamic => {
                if requested_high_quality {
                    Policy::CacheBased
                } else {
                    Policy::UncacheBased
                }
            }
            Policy::DynamicSmooth => {
                if requested_high_quality {
                    Policy::CacheBasedSmooth
                } else {
                    Policy::UncacheBasedSmooth
                }
            }
            Policy::DynamicBackendSpeed => {
                if requested_high_quality {
                    Policy::Unchange
                } else {
                    Policy::UncacheBasedSmooth
                }
            }
            concrete => concrete,
        }
    }
}

/// Signals the estimator publishes for the SMOOTH policies.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothSignals {
    pub cache_smooth_ratio: f64,
    pub uncache_smooth_ratio: f64,
}

/// Apply the resolved policy to one representation's advertised bandwidth.
///
/// `cached` says whether this representation of the client's next segment
/// has already transited the proxy. `size` is the nominal bit budget of one
/// segment; it cancels out of the plain rate policies but is kept in the
/// written form so the rates read as download-time ratios.
pub fn adjusted_bandwidth(
    policy: Policy,
    rendition: &Rendition,
    bandwidth: u64,
    cached: bool,
    throughput: &ClientThroughput,
    signals: &SmoothSignals,
) -> u64 {
    let size = rendition.segment_duration * bandwidth as f64;
    let tc = throughput.cached;
    let tu = throughput.uncached;

    match policy {
        Policy::Unchange | Policy::Baseline => bandwidth,

        Policy::CacheBased => {
            if cached {
                return bandwidth;
            }
            let rate = (size / tu) / (size / tc);
            if rate < 1.0 {
                debug!("skip smaller rewrite {rate}");
                bandwidth
            } else {
                (bandwidth as f64 * rate) as u64
            }
        }

        Policy::UncacheBased => {
            if !cached {
                return bandwidth;
            }
            let rate = (size / tc) / (size / tu);
            if rate > 1.0 {
                debug!("skip greater rewrite {rate}");
                bandwidth
            } else {
                (bandwidth as f64 * rate) as u64
            }
        }

        Policy::CacheBasedSmooth => {
            if cached {
                return bandwidth;
            }
            let rate = (size / tu) / (size / tc);
            if rate < 1.0 {
                debug!("skip smaller rewrite {rate}");
                return bandwidth;
            }
            let thr_cof = 1.0 / rate;
            let cof = signals.cache_smooth_ratio * (1.0 - thr_cof) + thr_cof;
            (bandwidth as f64 * rate * cof) as u64
        }

        Policy::UncacheBasedSmooth => {
            if !cached {
                return bandwidth;
            }
            let rate = (size / tc) / (size / tu);
            if rate > 1.0 {
                debug!("skip greater rewrite {rate}");
                return bandwidth;
            }
            let thr_cof = 1.0 / rate;
            let cof = signals.uncache_smooth_ratio * (thr_cof - 1.0) + 1.0;
            (bandwidth as f64 * rate * cof) as u64
        }

        Policy::Uniform => {
            let throughput_for = if cached { tc } else { tu };
            let mut rate = (size / throughput_for) / rendition.segment_duration;

            let n = throughput.cache_hist.len();
            if n > 0 {
                let hits: f64 = throughput.cache_hist.iter().sum();
                let p = hits / n as f64;
                rate = if cached {
                    1.0 + (rate - 1.0) * (1.0 - p)
                } else {
                    1.0 + (rate - 1.0) * p
                };
            }
            (bandwidth as f64 * rate) as u64
        }

        // Aliases are resolved before dispatch.
        Policy::Dynamic | Policy::DynamicSmooth | Policy::DynamicBackendSpeed => bandwidth,
    }
}
