//! MPD handling for the caching DASH proxy.
//!
//! `mpd::parser` turns manifest XML into [`mpd::MpdMetadata`] so the proxy
//! can learn segment templates and presentation length; `mpd::rewriter`
//! streams a manifest through unchanged except for the attributes the proxy
//! forces and the per-representation bandwidth values it supplies.

pub mod mpd;

pub use mpd::parser::parse_mpd;
pub use mpd::rewriter::{rewrite_mpd, RewriteOptions};
pub use mpd::{AdaptationSet, MpdMetadata, Period, Representation};
