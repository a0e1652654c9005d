// services/prefetch.rs

use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::services::presentation::Presentation;

/// Bound on queued prefetches. Producers never wait: overflow drops the
/// prefetch, which is non-essential work.
const QUEUE_CAPACITY: usize = 1000;

/// One speculative segment fetch to warm the upstream cache.
#[derive(Debug)]
pub struct PrefetchJob {
    pub url: reqwest::Url,
    pub segment: u64,
    pub rendition_id: String,
    pub segment_duration: f64,
    pub presentation: Arc<Presentation>,
}

/// Single background worker draining a bounded queue of prefetch jobs, so
/// outbound prefetch GETs towards the gateway are strictly serialized.
#[derive(Debug)]
pub struct Prefetcher {
    tx: mpsc::Sender<PrefetchJob>,
}

impl Prefetcher {
    pub fn spawn(client: Client, drain_when_slow: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run_worker(client, rx, drain_when_slow));
        Arc::new(Self { tx })
    }

    /// Never blocks the request path.
    pub fn enqueue(&self, job: PrefetchJob) {
        if self.tx.try_send(job).is_err() {
            debug!("prefetch queue full, dropping");
        }
    }
}

#[instrument(skip_all)]
async fn run_worker(client: Client, mut rx: mpsc::Receiver<PrefetchJob>, drain_when_slow: bool) {
    while let Some(job) = rx.recv().await {
        let started = Instant::now();
        info!(
            "prefetch segment {} quality {}",
            job.segment, job.rendition_id
        );

        match client.get(job.url.clone()).send().await {
            Ok(response) => {
                // Drain the body so the gateway actually materializes the
                // object before we mark it seen.
                if response.bytes().await.is_ok() {
                    job.presentation.record(job.segment, &job.rendition_id);
                }
            }
            Err(e) => debug!("prefetch {} failed: {e}", job.url),
        }

        if drain_when_slow && started.elapsed().as_secs_f64() > job.segment_duration {
            let mut dropped = 0;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!("prefetch overran segment duration, dropped {dropped} queued jobs");
            }
        }
    }
}

/// Pick the next prefetch target for a client that just fetched
/// `fullpath`: the next segment, at the highest quality whose declared
/// bandwidth still fits under the client's cached-throughput estimate (the
/// current quality when none does).
#[instrument(skip_all)]
pub fn plan_prefetch(
    presentation: &Arc<Presentation>,
    upstream: &reqwest::Url,
    pathkey: &str,
    fullpath: &str,
    cached_bps: f64,
) -> Option<PrefetchJob> {
    let (id, segment) = presentation.parse_id_number(fullpath)?;
    if segment == 0 {
        return None;
    }

    let mut quality = presentation
        .rendition_by_id(&id)
        .map(|r| r.quality)
        .unwrap_or(0);

    let mut qualities: Vec<i32> = presentation.renditions().map(|r| r.quality).collect();
    qualities.sort_unstable_by(|a, b| b.cmp(a));

    'find_best: for candidate in qualities {
        for rendition in presentation.renditions() {
            if rendition.quality == candidate && rendition.bandwidth < cached_bps {
                quality = candidate;
                break 'find_best;
            }
        }
    }

    let next_segment = segment + 1;
    let file = presentation.segment_file(next_segment, quality)?;
    let rendition_id = presentation
        .renditions()
        .find(|r| r.quality == quality)
        .map(|r| r.id.clone())?;

    let url = upstream.join(&format!("{pathkey}/{file}")).ok()?;

    Some(PrefetchJob {
        url,
        segment: next_segment,
        rendition_id,
        segment_duration: presentation
            .rendition_by_id(&id)
            .map(|r| r.segment_duration)
            .unwrap_or(1.0),
        presentation: Arc::clone(presentation),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dash_mpd::parse_mpd;

    fn presentation() -> Arc<Presentation> {
        let xml = r#"<MPD type="static"><Period duration="PT60S">
          <AdaptationSet mimeType="video/mp4">
            <Representation id="1" bandwidth="1000000">
              <SegmentTemplate timescale="1" duration="2" media="seg_1_$Number$.m4s"/>
            </Representation>
            <Representation id="2" bandwidth="2500000">
              <SegmentTemplate timescale="1" duration="2" media="seg_2_$Number$.m4s"/>
            </Representation>
            <Representation id="3" bandwidth="5000000">
              <SegmentTemplate timescale="1" duration="2" media="seg_3_$Number$.m4s"/>
            </Representation>
          </AdaptationSet>
        </Period></MPD>"#;
        Arc::new(Presentation::new(&parse_mpd(xml).unwrap()))
    }

    #[test]
    fn picks_highest_quality_under_cached_throughput() {
        let p = presentation();
        let upstream = reqwest::Url::parse("http://gateway:8080").unwrap();

        // cached estimate 3 Mbps: quality 3 (5 Mbps) is too expensive,
        // quality 2 (2.5 Mbps) fits.
        let job = plan_prefetch(&p, &upstream, "/v", "/v/seg_1_7.m4s", 3_000_000.0).unwrap();
        assert_eq!(job.segment, 8);
        assert_eq!(job.rendition_id, "2");
        assert_eq!(job.url.as_str(), "http://gateway:8080/v/seg_2_8.m4s");
    }

    #[test]
    fn keeps_current_quality_when_nothing_fits() {
        let p = presentation();
        let upstream = reqwest::Url::parse("http://gateway:8080").unwrap();

        let job = plan_prefetch(&p, &upstream, "/v", "/v/seg_1_7.m4s", 500_000.0).unwrap();
        assert_eq!(job.rendition_id, "1");
        assert_eq!(job.segment, 8);
    }

    #[test]
    fn skips_segment_zero_and_unknown_urls() {
        let p = presentation();
        let upstream = reqwest::Url::parse("http://gateway:8080").unwrap();

        assert!(plan_prefetch(&p, &upstream, "/v", "/v/seg_1_0.m4s", 3_000_000.0).is_none());
        assert!(plan_prefetch(&p, &upstream, "/v", "/v/stream.mpd", 3_000_000.0).is_none());
    }

    #[tokio::test]
    async fn worker_serializes_and_queue_drops_on_overflow() {
        // The queue is bounded and multi-producer; try_send never blocks.
        let (tx, mut rx) = mpsc::channel::<u32>(2);
        assert!(tx.try_send(1).is_ok());
        assert!(tx.try_send(2).is_ok());
        assert!(tx.try_send(3).is_err());

        // The single consumer sees jobs strictly in order.
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }
}
