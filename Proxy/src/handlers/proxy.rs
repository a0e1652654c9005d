// handlers/proxy.rs

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

use dash_mpd::{parse_mpd, rewrite_mpd, RewriteOptions};

use crate::services::policy::{adjusted_bandwidth, Policy, SmoothSignals};
use crate::services::prefetch::plan_prefetch;
use crate::services::throughput::MIN_SAMPLE_BYTES;
use crate::types::AppState;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const SETUP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Catch-all GET: transparently proxy to the upstream gateway, rewriting
/// manifests on the way back and feeding the ledger/estimator from
/// completed media transfers.
#[instrument(skip_all, fields(path = %uri.path()))]
pub async fn proxy_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let fullpath = uri.path().to_string();
    let pathkey = fullpath
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or("")
        .to_string();
    let pathname = fullpath.rsplit('/').next().unwrap_or("").to_string();

    let client_id = headers
        .get("clientID")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    state.clients.ensure(&client_id);

    let target = match join_upstream(&state.upstream, &fullpath, uri.query()) {
        Some(url) => url,
        None => {
            error!("cannot map {fullpath} onto the upstream gateway");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let mut request = state.http.get(target);
    for (name, value) in headers.iter() {
        // Conditional-GET headers are stripped so neither the client nor
        // the gateway can short-circuit with a revalidation; Host belongs
        // to the upstream.
        if name == header::HOST
            || name == header::IF_MODIFIED_SINCE
            || name == header::IF_NONE_MATCH
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        request = request.header(name, value);
    }

    let request_timeout = if state.policy.read().unwrap().setup_mode {
        SETUP_REQUEST_TIMEOUT
    } else {
        REQUEST_TIMEOUT
    };

    let started = Instant::now();
    let outcome = timeout(request_timeout, async {
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok::<_, reqwest::Error>((status, headers, body))
    })
    .await;

    let (status, upstream_headers, mut body) = match outcome {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            error!("upstream transport error for {pathname}: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
        Err(_) => {
            // Aborted: drop the in-flight upstream transfer and skip every
            // post-transfer update.
            warn!("{pathname} timed out after {request_timeout:?}, closing");
            return StatusCode::GATEWAY_TIMEOUT.into_response();
        }
    };
    let transfer_time = started.elapsed();

    let is_mpd = pathname.ends_with(".mpd");
    if is_mpd {
        if status == StatusCode::OK {
            body = rewrite_manifest(&state, &pathkey, &client_id, body);
        } else {
            warn!("upstream returned {status} for manifest {pathname}");
        }
    } else if body.len() >= MIN_SAMPLE_BYTES {
        if let Some(presentation) = state.presentations.get(&pathkey) {
            let snapshot = state.policy.read().unwrap().clone();
            if !snapshot.setup_mode && !snapshot.prefetch_off {
                let cached_bps = state.clients.snapshot(&client_id).cached;
                if let Some(job) =
                    plan_prefetch(&presentation, &state.upstream, &pathkey, &fullpath, cached_bps)
                {
                    state.prefetcher.enqueue(job);
                }
            }

            let cached = presentation.already_cached_url(&fullpath);
            let observation = state
                .clients
                .update(&client_id, body.len(), transfer_time, cached);

            state.policy.write().unwrap().requested_high_quality =
                observation.requested_high_quality;
            *state.signals.write().unwrap() = SmoothSignals {
                cache_smooth_ratio: observation.cache_smooth_ratio,
                uncache_smooth_ratio: observation.uncache_smooth_ratio,
            };

            if let Err(e) = presentation.record_from_url(&fullpath, &client_id) {
                debug!("{e}; rewrites quiesce for client '{client_id}'");
            }
        }
    }

    let mut response = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        if is_mpd && (name == header::LAST_MODIFIED || name == header::CACHE_CONTROL) {
            continue;
        }
        response = response.header(name, value);
    }
    if is_mpd {
        response = response
            .header(header::CONTENT_LENGTH, body.len())
            .header(
                header::LAST_MODIFIED,
                Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            )
            .header(header::CACHE_CONTROL, "no-cache");
    }

    response.body(Body::from(body)).unwrap()
}

/// Rewrite a manifest body per the active policy. Any decode or re-encode
/// failure hands the upstream bytes through untouched.
#[instrument(skip_all)]
fn rewrite_manifest(state: &AppState, pathkey: &str, client_id: &str, body: Bytes) -> Bytes {
    let xml = match std::str::from_utf8(&body) {
        Ok(xml) => xml,
        Err(e) => {
            error!("mpd decode error: {e}");
            return body;
        }
    };
    let meta = match parse_mpd(xml) {
        Ok(meta) => meta,
        Err(e) => {
            error!("mpd decode error: {e}");
            return body;
        }
    };

    let presentation = state.presentations.get_or_create(pathkey, &meta);
    let snapshot = state.policy.read().unwrap().clone();
    let signals = *state.signals.read().unwrap();
    let throughput = state.clients.snapshot(client_id);
    let (cached_set, latest) = presentation.latest(client_id);
    debug!("for segment {latest}: {cached_set:?}");

    // A client that has seen the final segment gets its manifest untouched.
    let policy = if presentation.is_terminal(client_id) {
        Policy::Unchange
    } else {
        snapshot.policy.resolve(snapshot.requested_high_quality)
    };

    let rewritten = rewrite_mpd(xml, &RewriteOptions::default(), |id, bandwidth| {
        match presentation.rendition_by_id(id) {
            Some(rendition) => adjusted_bandwidth(
                policy,
                rendition,
                bandwidth,
                cached_set.contains(id),
                &throughput,
                &signals,
            ),
            None => bandwidth,
        }
    });

    match rewritten {
        Ok(new_body) => Bytes::from(new_body),
        Err(e) => {
            error!("mpd encode failed, returning the original: {e}");
            body
        }
    }
}

fn join_upstream(upstream: &reqwest::Url, path: &str, query: Option<&str>) -> Option<reqwest::Url> {
    let mut url = upstream.join(path).ok()?;
    url.set_query(query);
    Some(url)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::prefetch::Prefetcher;
    use crate::services::presentation::PresentationRegistry;
    use crate::services::throughput::ThroughputRegistry;
    use crate::types::PolicySnapshot;
    use quick_xml::events::Event;
    use quick_xml::Reader;
    use std::sync::Arc;
    use std::sync::RwLock;

    const MANIFEST: &str = r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
  <Period duration="PT20S">
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
  </Period>
</MPD>"#;

    fn state() -> AppState {
        AppState {
            upstream: reqwest::Url::parse("http://gateway:8080").unwrap(),
            http: reqwest::Client::new(),
            presentations: Arc::new(PresentationRegistry::new()),
            clients: Arc::new(ThroughputRegistry::new()),
            prefetcher: Prefetcher::spawn(reqwest::Client::new(), false),
            policy: Arc::new(RwLock::new(PolicySnapshot::default())),
            signals: Arc::new(RwLock::new(SmoothSignals::default())),
        }
    }

    fn attribute_values(xml: &str, tag: &str, attr_name: &str) -> Vec<String> {
        let mut reader = Reader::from_str(xml);
        let mut buf = Vec::new();
        let mut values = vec![];
        while let Ok(event) = reader.read_event_into(&mut buf) {
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    if e.name().as_ref() == tag.as_bytes() {
                        for attr in e.attributes() {
                            let attr = attr.unwrap();
                            if attr.key.as_ref() == attr_name.as_bytes() {
                                values.push(attr.unescape_value().unwrap().to_string());
                            }
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        values
    }

    #[tokio::test]
    async fn unchange_policy_touches_only_forced_attributes() {
        let state = state();
        let out = rewrite_manifest(&state, "/v", "", Bytes::from(MANIFEST));
        let out = std::str::from_utf8(&out).unwrap().to_string();

        assert_eq!(attribute_values(&out, "MPD", "type"), vec!["dynamic"]);
        assert_eq!(
            attribute_values(&out, "MPD", "minimumUpdatePeriod"),
            vec!["PT5S"]
        );
        assert_eq!(
            attribute_values(&out, "MPD", "availabilityStartTime"),
            vec!["1970-01-01T00:00:00Z"]
        );
        assert_eq!(attribute_values(&out, "Period", "start"), vec!["PT0S"]);
        assert_eq!(
            attribute_values(&out, "SegmentTemplate", "presentationTimeOffset"),
            vec!["0", "0", "0"]
        );
        assert_eq!(
            attribute_values(&out, "Representation", "bandwidth"),
            vec!["500000", "1000000", "2000000"]
        );
    }

    #[tokio::test]
    async fn cachebased_upweights_only_unseen_renditions() {
        let state = state();
        state.policy.write().unwrap().policy = Policy::CacheBased;

        // Prime the presentation, then make segment 5 the client's next
        // segment with only quality 1 already in transit.
        rewrite_manifest(&state, "/v", "c", Bytes::from(MANIFEST));
        let presentation = state.presentations.get("/v").unwrap();
        presentation.record_from_url("/v/seg_1_4.m4s", "c").unwrap();
        presentation.record(5, "1");

        // Default estimates: cached 15 Mbps / uncached 10 Mbps -> rate 1.5.
        let out = rewrite_manifest(&state, "/v", "c", Bytes::from(MANIFEST));
        let out = std::str::from_utf8(&out).unwrap().to_string();
        assert_eq!(
            attribute_values(&out, "Representation", "bandwidth"),
            vec!["500000", "1500000", "3000000"]
        );
    }

    #[tokio::test]
    async fn terminal_client_gets_untouched_bandwidths() {
        let state = state();
        state.policy.write().unwrap().policy = Policy::CacheBased;

        rewrite_manifest(&state, "/v", "c", Bytes::from(MANIFEST));
        let presentation = state.presentations.get("/v").unwrap();
        // 20 s period at 2 s per segment: segment 10 is the last one.
        assert!(presentation.record_from_url("/v/seg_1_10.m4s", "c").is_err());

        let out = rewrite_manifest(&state, "/v", "c", Bytes::from(MANIFEST));
        let out = std::str::from_utf8(&out).unwrap().to_string();
        assert_eq!(
            attribute_values(&out, "Representation", "bandwidth"),
            vec!["500000", "1000000", "2000000"]
        );
        // Forced attributes still apply to the quiesced manifest.
        assert_eq!(attribute_values(&out, "MPD", "type"), vec!["dynamic"]);
    }

    #[tokio::test]
    async fn undecodable_manifest_is_forwarded_verbatim() {
        let state = state();
        let body = Bytes::from_static(b"this is not a manifest");
        let out = rewrite_manifest(&state, "/v", "c", body.clone());
        assert_eq!(out, body);
        assert!(state.presentations.get("/v").is_none());
    }

    #[test]
    fn pathkey_splits_like_a_directory() {
        let fullpath = "/v/stream.mpd";
        let (dir, file) = fullpath.rsplit_once('/').unwrap();
        assert_eq!(dir, "/v");
        assert_eq!(file, "stream.mpd");
    }
}
