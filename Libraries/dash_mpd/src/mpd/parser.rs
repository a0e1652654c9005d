use crate::mpd::{AdaptationSet, MpdMetadata, Period, Representation};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

#[allow(clippy::if_same_then_else)]
fn infer_content_type(mime_type: &str) -> &str {
    if mime_type.contains("audio") {
        "audio"
    } else if mime_type.contains("video") {
        "video"
    } else {
        "video" // fallback
    }
}

fn resolve_template(rep: &mut Representation, template: &HashMap<String, String>) {
    rep.media = template
        .get("media")
        .unwrap_or(&"".to_string())
        .replace("$RepresentationID$", &rep.id);

    if let Some(dur) = template.get("duration") {
        rep.segment_duration = dur.parse::<f64>().unwrap_or(1.0);
    }
    if let Some(ts) = template.get("timescale") {
        rep.timescale = ts.parse::<u64>().unwrap_or(1);
    }

    rep.segment_duration /= rep.timescale as f64;
    rep.has_template = true;
}

pub fn parse_mpd(xml: &str) -> Result<MpdMetadata, Box<dyn std::error::Error + Send + Sync>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut periods = vec![];
    let mut mpd_type = None;
    let mut inside_rep = false;

    let mut current_period: Option<Period> = None;
    let mut current_adaptation: Option<AdaptationSet> = None;
    let mut current_rep: Option<Representation> = None;
    let mut adaptation_template: Option<HashMap<String, String>> = None;

    while let Ok(event) = reader.read_event_into(&mut buf) {
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = e.name().to_owned();
                let tag = std::str::from_utf8(name.as_ref())?;
                let empty = matches!(event, Event::Empty(_));

                match tag {
                    "MPD" => {
                        for attr in e.attributes() {
                            let attr = attr?;
                            if attr.key.as_ref() == b"type" {
                                mpd_type = Some(attr.unescape_value()?.to_string());
                            }
                        }
                    }
                    "Period" => {
                        let mut duration_secs = None;
                        for attr in e.attributes() {
                            let attr = attr?;
                            if attr.key.as_ref() == b"duration" {
                                duration_secs = parse_duration(&attr.unescape_value()?);
                            }
                        }
                        current_period = Some(Period {
                            duration_secs,
                            adaptation_sets: vec![],
                        });
                    }
                    "AdaptationSet" => {
                        let mut mime = String::new();
                        let mut content = String::new();

                        for attr in e.attributes() {
                            let attr = attr?;
                            match attr.key.as_ref() {
                                b"mimeType" => mime = attr.unescape_value()?.to_string(),
                                b"contentType" => content = attr.unescape_value()?.to_string(),
                                _ => {}
                            }
                        }

                        let fallback = infer_content_type(&mime).to_string();
                        current_adaptation = Some(AdaptationSet {
                            content_type: if !content.is_empty() { content } else { fallback },
                            mime_type: mime,
                            representations: vec![],
                            segment_template: None,
                        });
                    }
                    "Representation" => {
                        inside_rep = !empty;
                        let mut id = String::new();
                        let mut bandwidth = 0;

                        for attr in e.attributes() {
                            let attr = attr?;
                            match attr.key.as_ref() {
                                b"id" => id = attr.unescape_value()?.to_string(),
                                b"bandwidth" => {
                                    bandwidth = attr.unescape_value()?.parse::<u64>()?;
                                }
                                _ => {}
                            }
                        }

                        let mut rep = Representation {
                            id,
                            bandwidth,
                            media: String::new(),
                            segment_duration: 0.0,
                            timescale: 1,
                            has_template: false,
                        };

                        if empty {
                            if let Some(template) = adaptation_template.as_ref() {
                                resolve_template(&mut rep, template);
                            }
                            if let Some(adaptation) = current_adaptation.as_mut() {
                                adaptation.representations.push(rep);
                            }
                        } else {
                            current_rep = Some(rep);
                        }
                    }
                    "SegmentTemplate" => {
                        let mut map = HashMap::new();
                        for attr in e.attributes() {
                            let attr = attr?;
                            let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
                            let value = attr.unescape_value()?.to_string();
                            map.insert(key, value);
                        }

                        if inside_rep {
                            if let Some(rep) = current_rep.as_mut() {
                                resolve_template(rep, &map);
                            }
                        } else {
                            adaptation_template = Some(map);
                        }
                    }
                    _ => {}
                }
            }

            Event::End(ref e) => {
                let name = e.name().to_owned();
                let tag = std::str::from_utf8(name.as_ref())?;

                match tag {
                    "Representation" => {
                        inside_rep = false;
                        if let Some(mut rep) = current_rep.take() {
                            if !rep.has_template {
                                if let Some(template) = adaptation_template.as_ref() {
                                    resolve_template(&mut rep, template);
                                }
                            }

                            if let Some(adaptation) = current_adaptation.as_mut() {
                                adaptation.representations.push(rep);
                            }
                        }
                    }
                    "AdaptationSet" => {
                        if let Some(mut adapt) = current_adaptation.take() {
                            adapt.segment_template = adaptation_template.take();
                            for rep in adapt.representations.iter_mut() {
                                if !rep.has_template {
                                    if let Some(template) = adapt.segment_template.as_ref() {
                                        resolve_template(rep, template);
                                    }
                                }
                                if rep.segment_duration == 0.0 {
                                    rep.segment_duration = 1.0;
                                }
                            }
                            if let Some(period) = current_period.as_mut() {
                                period.adaptation_sets.push(adapt);
                            }
                        }
                    }
                    "Period" => {
                        if let Some(period) = current_period.take() {
                            periods.push(period);
                        }
                    }
                    _ => {}
                }
            }

            Event::Eof => break,
            _ => {}
        }

        buf.clear();
    }

    if periods.is_empty() {
        return Err("MPD contains no Period".into());
    }

    Ok(MpdMetadata { mpd_type, periods })
}

fn parse_duration(value: &str) -> Option<f64> {
    let iso = iso8601_duration::Duration::parse(value).ok()?;
    iso.to_std().map(|d| d.as_secs_f64())
}
