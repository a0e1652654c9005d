// services/presentation.rs

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, RwLock};

use dash_mpd::MpdMetadata;
use tracing::{debug, instrument};

/// One rendition's URL template, indexed by `prefix` in the matcher.
///
/// A media URL `<prefix><N><suffix>` decodes back to this rendition and
/// segment number N.
#[derive(Debug, Clone)]
pub struct Rendition {
    pub id: String,
    pub prefix: String,
    pub suffix: String,
    /// Bandwidth declared by the upstream manifest, bits per second.
    pub bandwidth: f64,
    /// `id` parsed as an integer, 0 when it does not parse.
    pub quality: i32,
    /// Segment duration in seconds.
    pub segment_duration: f64,
}

#[derive(Debug)]
pub enum LedgerError {
    /// The client requested the final segment of the presentation.
    StreamComplete { segment: u64 },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::StreamComplete { segment } => {
                write!(f, "stream complete at segment {segment}")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

#[derive(Debug, Default)]
struct LedgerState {
    // segment number -> representation ids observed in transit or prefetched
    seen: HashMap<u64, HashSet<String>>,
    // client id -> greatest segment number successfully fetched
    progress: HashMap<String, u64>,
    terminal: HashSet<String>,
}

/// Per-presentation cache ledger plus the URL templates extracted from the
/// first manifest the proxy saw for this pathkey. Lives for the process.
#[derive(Debug)]
pub struct Presentation {
    url_matcher: HashMap<String, Rendition>,
    max_segment: u64,
    ledger: Mutex<LedgerState>,
}

impl Presentation {
    #[instrument(skip_all)]
    pub fn new(meta: &MpdMetadata) -> Self {
        let mut url_matcher = HashMap::new();
        let mut max_segment = 0u64;

        for period in &meta.periods {
            let mut segment_secs = 0.0;
            for adaptation in &period.adaptation_sets {
                for rep in &adaptation.representations {
                    let Some(pos) = rep.media.rfind("$Number$") else {
                        continue;
                    };
                    segment_secs = rep.segment_duration;
                    url_matcher.insert(
                        rep.media[..pos].to_string(),
                        Rendition {
                            id: rep.id.clone(),
                            prefix: rep.media[..pos].to_string(),
                            suffix: rep.media[pos + "$Number$".len()..].to_string(),
                            bandwidth: rep.bandwidth as f64,
                            quality: rep.id.parse::<i32>().unwrap_or(0),
                            segment_duration: rep.segment_duration,
                        },
                    );
                }
            }

            if segment_secs > 0.0 {
                let period_secs = period.duration_secs.unwrap_or(0.0);
                max_segment += (period_secs / segment_secs) as u64;
            }
        }

        Self {
            url_matcher,
            max_segment,
            ledger: Mutex::new(LedgerState::default()),
        }
    }

    pub fn max_segment(&self) -> u64 {
        self.max_segment
    }

    pub fn renditions(&self) -> impl Iterator<Item = &Rendition> {
        self.url_matcher.values()
    }

    pub fn rendition_by_id(&self, id: &str) -> Option<&Rendition> {
        self.url_matcher.values().find(|r| r.id == id)
    }

    /// Decode `(representation id, segment number)` from a media URL.
    /// Ties between overlapping prefixes go to the longest match; unknown
    /// URLs yield `None` and are treated as non-media by the pipeline.
    pub fn parse_id_number(&self, url: &str) -> Option<(String, u64)> {
        let base = url.rsplit('/').next().unwrap_or(url);
        let rendition = self
            .url_matcher
            .values()
            .filter(|r| base.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len())?;

        let trimmed = base
            .strip_prefix(&rendition.prefix)
            .and_then(|rest| rest.strip_suffix(&rendition.suffix))?;
        let number = trimmed.parse::<u64>().unwrap_or(0);
        Some((rendition.id.clone(), number))
    }

    /// Form the media file name `<prefix><segment><suffix>` for a quality
    /// level, for the prefetcher.
    pub fn segment_file(&self, segment: u64, quality: i32) -> Option<String> {
        self.url_matcher
            .values()
            .find(|r| r.quality == quality)
            .map(|r| format!("{}{}{}", r.prefix, segment, r.suffix))
    }

    pub fn already_cached(&self, segment: u64, id: &str) -> bool {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .seen
            .get(&segment)
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    pub fn already_cached_url(&self, url: &str) -> bool {
        match self.parse_id_number(url) {
            Some((id, number)) if number != 0 => self.already_cached(number, &id),
            _ => false,
        }
    }

    /// The seen-set of the segment the client will ask for next, and that
    /// segment's number. Empty set when nothing was recorded for it yet.
    pub fn latest(&self, client: &str) -> (HashSet<String>, u64) {
        let ledger = self.ledger.lock().unwrap();
        let next = ledger.progress.get(client).copied().unwrap_or(0) + 1;
        let set = ledger.seen.get(&next).cloned().unwrap_or_default();
        (set, next)
    }

    /// Idempotent: recording the same pair twice is a no-op.
    pub fn record(&self, segment: u64, id: &str) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger
            .seen
            .entry(segment)
            .or_default()
            .insert(id.to_string());
    }

    /// Record a completed media transfer. Marks the client terminal (and
    /// fails with `StreamComplete`) when the final segment is reached;
    /// progress only ever moves forward.
    pub fn record_from_url(&self, url: &str, client: &str) -> Result<(), LedgerError> {
        let Some((id, number)) = self.parse_id_number(url) else {
            return Ok(());
        };

        if number == self.max_segment {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.terminal.insert(client.to_string());
            debug!("client {client} reached final segment {number}");
            return Err(LedgerError::StreamComplete { segment: number });
        }

        if number != 0 {
            let mut ledger = self.ledger.lock().unwrap();
            let progress = ledger.progress.entry(client.to_string()).or_insert(0);
            if number > *progress {
                *progress = number;
            }
            ledger.seen.entry(number).or_default().insert(id);
        }
        Ok(())
    }

    /// Greatest integer-parsed representation id seen for a segment, -1 when
    /// nothing was recorded.
    pub fn greatest_quality(&self, segment: u64) -> i32 {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .seen
            .get(&segment)
            .and_then(|set| set.iter().filter_map(|id| id.parse::<i32>().ok()).max())
            .unwrap_or(-1)
    }

    pub fn is_terminal(&self, client: &str) -> bool {
        self.ledger.lock().unwrap().terminal.contains(client)
    }
}

/// Process-wide map of pathkey -> Presentation. Read-heavy; lazy insert
/// under the write lock.
#[derive(Debug, Default)]
pub struct PresentationRegistry {
    presentations: RwLock<HashMap<String, std::sync::Arc<Presentation>>>,
}

impl PresentationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pathkey: &str) -> Option<std::sync::Arc<Presentation>> {
        self.presentations.read().unwrap().get(pathkey).cloned()
    }

    #[instrument(skip_all)]
    pub fn get_or_create(&self, pathkey: &str, meta: &MpdMetadata) -> std::sync::Arc<Presentation> {
        if let Some(existing) = self.get(pathkey) {
            return existing;
        }

        let mut write_guard = self.presentations.write().unwrap();
        write_guard
            .entry(pathkey.to_string())
            .or_insert_with(|| std::sync::Arc::new(Presentation::new(meta)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dash_mpd::parse_mpd;

    fn fixture() -> Presentation {
        let xml = r#"<MPD type="static"><Period duration="PT20S">
          <AdaptationSet mimeType="video/mp4">
            <Representation id="1" bandwidth="500000">
              <SegmentTemplate timescale="1000" duration="2000" media="seg_1_$Number$.m4s"/>
            </Representation>
            <Representation id="2" bandwidth="1000000">
              <SegmentTemplate timescale="1000" duration="2000" media="seg_2_$Number$.m4s"/>
            </Representation>
            <Representation id="3" bandwidth="2000000">
              <SegmentTemplate timescale="1000" duration="2000" media="seg_3_$Number$.m4s"/>
            </Representation>
          </AdaptationSet>
        </Period></MPD>"#;
        Presentation::new(&parse_mpd(xml).unwrap())
    }

    #[test]
    fn template_round_trip() {
        let p = fixture();
        for quality in 1..=3 {
            for n in [1u64, 7, 42, 1000] {
                let file = p.segment_file(n, quality).unwrap();
                let (id, number) = p.parse_id_number(&file).unwrap();
                assert_eq!(id, quality.to_string());
                assert_eq!(number, n);
            }
        }
    }

    #[test]
    fn max_segment_from_period_duration() {
        // 20 s period / 2 s segments
        assert_eq!(fixture().max_segment(), 10);
    }

    #[test]
    fn longest_prefix_wins() {
        let xml = r#"<MPD type="static"><Period duration="PT20S">
          <AdaptationSet mimeType="video/mp4">
            <Representation id="1" bandwidth="500000">
              <SegmentTemplate timescale="1" duration="2" media="seg_$Number$.m4s"/>
            </Representation>
            <Representation id="11" bandwidth="900000">
              <SegmentTemplate timescale="1" duration="2" media="seg_1$Number$.m4s"/>
            </Representation>
          </AdaptationSet>
        </Period></MPD>"#;
        let p = Presentation::new(&parse_mpd(xml).unwrap());

        // "seg_15.m4s" matches both "seg_" and "seg_1"; the longer prefix
        // decodes to representation 11, segment 5.
        let (id, number) = p.parse_id_number("/v/seg_15.m4s").unwrap();
        assert_eq!(id, "11");
        assert_eq!(number, 5);
    }

    #[test]
    fn unknown_urls_do_not_match() {
        let p = fixture();
        assert!(p.parse_id_number("/v/stream.mpd").is_none());
        assert!(!p.already_cached_url("/v/stream.mpd"));
    }

    #[test]
    fn record_is_idempotent_and_monotone() {
        let p = fixture();
        p.record(5, "1");
        p.record(5, "1");
        p.record(5, "2");
        assert!(p.already_cached(5, "1"));
        assert!(p.already_cached(5, "2"));
        assert!(!p.already_cached(5, "3"));
        assert_eq!(p.greatest_quality(5), 2);
        assert_eq!(p.greatest_quality(6), -1);
    }

    #[test]
    fn progress_never_regresses() {
        let p = fixture();
        p.record_from_url("/v/seg_1_7.m4s", "client-a").unwrap();
        let (_, latest) = p.latest("client-a");
        assert_eq!(latest, 8);

        // A stale writer reporting an earlier segment must not move
        // progress backwards.
        p.record_from_url("/v/seg_1_3.m4s", "client-a").unwrap();
        let (_, latest) = p.latest("client-a");
        assert_eq!(latest, 8);
    }

    #[test]
    fn latest_returns_seen_set_of_next_segment() {
        let p = fixture();
        p.record_from_url("/v/seg_1_4.m4s", "c").unwrap();
        p.record(5, "1");
        p.record(5, "3");
        let (set, latest) = p.latest("c");
        assert_eq!(latest, 5);
        assert!(set.contains("1"));
        assert!(set.contains("3"));
        assert!(!set.contains("2"));
    }

    #[test]
    fn final_segment_marks_terminal() {
        let p = fixture();
        assert!(!p.is_terminal("c"));
        let err = p.record_from_url("/v/seg_2_10.m4s", "c").unwrap_err();
        assert!(matches!(err, LedgerError::StreamComplete { segment: 10 }));
        assert!(p.is_terminal("c"));

        // Later requests for the final segment keep failing the same way.
        assert!(p.record_from_url("/v/seg_2_10.m4s", "c").is_err());
    }
}
