//! DASH manifest data structures (MPD and related types).
//! These represent parsed MPEG-DASH metadata including segment templates and
//! period timing, which is everything the proxy needs to reason about a
//! presentation.

pub mod parser;
pub mod rewriter;

use std::collections::HashMap;

/// A single video/audio representation within an adaptation set.
#[derive(Debug, Clone)]
pub struct Representation {
    /// Unique identifier for the representation.
    pub id: String,
    /// Average bandwidth in bits per second (bps).
    pub bandwidth: u64,
    /// URL template for the media segments (may contain $Number$, $Time$, etc.).
    pub media: String,
    /// Duration of each segment in seconds. Derived from `duration / timescale` in SegmentTemplate.
    pub segment_duration: f64,
    /// Timescale used to convert segment timing to seconds.
    pub timescale: u64,
    /// True if a usable SegmentTemplate was resolved for this representation.
    pub has_template: bool,
}

/// An adaptation set groups representations with the same content type (e.g., audio or video).
#[derive(Debug, Clone)]
pub struct AdaptationSet {
    /// Content type of the adaptation set (e.g., "audio" or "video").
    pub content_type: String,
    /// MIME type of the media (e.g., "video/mp4").
    pub mime_type: String,
    /// All representations available in this adaptation set.
    pub representations: Vec<Representation>,
    /// Optional SegmentTemplate attributes defined at the AdaptationSet level.
    pub segment_template: Option<HashMap<String, String>>,
}

/// One Period of the presentation.
#[derive(Debug, Clone)]
pub struct Period {
    /// Period duration in seconds, parsed from the ISO-8601 `duration` attribute.
    pub duration_secs: Option<f64>,
    /// All adaptation sets (audio/video tracks) in this period.
    pub adaptation_sets: Vec<AdaptationSet>,
}

/// Top-level metadata parsed from an MPD file.
#[derive(Debug, Clone)]
pub struct MpdMetadata {
    /// The `type` attribute of the MPD ("static" or "dynamic").
    pub mpd_type: Option<String>,
    /// All periods of the presentation, in document order.
    pub periods: Vec<Period>,
}

impl MpdMetadata {
    /// Iterate over every representation across all periods.
    pub fn representations(&self) -> impl Iterator<Item = &Representation> {
        self.periods
            .iter()
            .flat_map(|p| p.adaptation_sets.iter())
            .flat_map(|a| a.representations.iter())
    }
}
