//! Local audio resolver and streaming cache.
//!
//! Tracks identified by (title, artist) are resolved to a source id on an
//! external video platform, pulled down with an ordered list of extraction
//! strategies, streamed to the requesting client while being cached, and
//! served back out with byte-range support once finalized.

pub mod cache;
pub mod downloads;
pub mod error;
pub mod mapping;
pub mod paths;
pub mod serve;
pub mod server;
pub mod stream;
pub mod transcode;
pub mod ytdlp;
