use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

type RewriteError = Box<dyn std::error::Error + Send + Sync>;

/// Attribute values the proxy forces onto every manifest it serves.
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// Value of `MPD@minimumUpdatePeriod` in seconds.
    pub minimum_update_period_secs: u64,
    /// Value of `MPD@availabilityStartTime`.
    pub availability_start_time: String,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            minimum_update_period_secs: 5,
            availability_start_time: "1970-01-01T00:00:00Z".to_string(),
        }
    }
}

/// Streams `xml` through untouched except for the forced attributes and the
/// per-representation bandwidth supplied by `bandwidth_fn(id, bandwidth)`.
///
/// Everything else (namespaces, BaseURL, codec strings, unknown elements)
/// passes through verbatim.
pub fn rewrite_mpd<F>(
    xml: &str,
    opts: &RewriteOptions,
    mut bandwidth_fn: F,
) -> Result<String, RewriteError>
where
    F: FnMut(&str, u64) -> u64,
{
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let rewritten = rewrite_element(&e, opts, &mut bandwidth_fn)?;
                writer.write_event(Event::Start(rewritten))?;
            }
            Event::Empty(e) => {
                let rewritten = rewrite_element(&e, opts, &mut bandwidth_fn)?;
                writer.write_event(Event::Empty(rewritten))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    let result = writer.into_inner().into_inner();
    Ok(String::from_utf8(result)?)
}

fn rewrite_element<F>(
    e: &BytesStart<'_>,
    opts: &RewriteOptions,
    bandwidth_fn: &mut F,
) -> Result<BytesStart<'static>, RewriteError>
where
    F: FnMut(&str, u64) -> u64,
{
    let name = std::str::from_utf8(e.name().as_ref())?.to_string();

    match name.as_str() {
        "MPD" => force_attributes(
            e,
            &[
                ("type", "dynamic".to_string()),
                (
                    "minimumUpdatePeriod",
                    format!("PT{}S", opts.minimum_update_period_secs),
                ),
                (
                    "availabilityStartTime",
                    opts.availability_start_time.clone(),
                ),
            ],
        ),
        "Period" => force_attributes(e, &[("start", "PT0S".to_string())]),
        "SegmentTemplate" => {
            force_attributes(e, &[("presentationTimeOffset", "0".to_string())])
        }
        "Representation" => {
            let mut id = String::new();
            let mut bandwidth: Option<u64> = None;
            for attr in e.attributes() {
                let attr = attr?;
                match attr.key.as_ref() {
                    b"id" => id = attr.unescape_value()?.to_string(),
                    b"bandwidth" => bandwidth = attr.unescape_value()?.parse::<u64>().ok(),
                    _ => {}
                }
            }

            match bandwidth {
                Some(bw) => {
                    let new_bw = bandwidth_fn(&id, bw);
                    force_attributes(e, &[("bandwidth", new_bw.to_string())])
                }
                None => force_attributes(e, &[]),
            }
        }
        _ => force_attributes(e, &[]),
    }
}

/// Copies `e` with `forced` attribute values replacing (or appended after)
/// the originals. Attribute order is otherwise preserved.
fn force_attributes(
    e: &BytesStart<'_>,
    forced: &[(&str, String)],
) -> Result<BytesStart<'static>, RewriteError> {
    let name = std::str::from_utf8(e.name().as_ref())?.to_string();
    let mut out = BytesStart::new(name);
    let mut missing: Vec<&(&str, String)> = forced.iter().collect();

    for attr in e.attributes() {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
        if let Some(pos) = missing.iter().position(|(k, _)| *k == key) {
            let (_, value) = missing.remove(pos);
            out.push_attribute((key.as_str(), value.as_str()));
        } else {
            let value = attr.unescape_value()?;
            out.push_attribute((key.as_str(), value.as_ref()));
        }
    }

    for (key, value) in missing {
        out.push_attribute((*key, value.as_str()));
    }

    Ok(out)
}
