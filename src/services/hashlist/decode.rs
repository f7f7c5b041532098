//! Hash-list document decoding
//!
//! A document is an HTML page whose iframe `src` fragment carries an
//! LZ-String (URI-component alphabet) compressed JSON payload, either
//! `{"title": ..., "torrents": [...]}` or a bare torrent array.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

lazy_static! {
    static ref IFRAME_FRAGMENT: Regex = Regex::new(r#"<iframe[^>]+src="[^"]+#([^"]+)""#).unwrap();
}

/// (infohash, filename, size) as listed in a document; not yet validated
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentTriple {
    pub hash: String,
    pub filename: String,
    pub bytes: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Titled { torrents: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

fn triple_from_value(value: &serde_json::Value) -> Option<TorrentTriple> {
    let hash = value.get("hash")?.as_str()?.to_string();
    let filename = value
        .get("filename")
        .and_then(|f| f.as_str())
        .unwrap_or_default()
        .to_string();
    let bytes = value
        .get("bytes")
        .and_then(|b| b.as_u64().or_else(|| b.as_f64().map(|f| f.max(0.0) as u64)))
        .unwrap_or(0);
    Some(TorrentTriple {
        hash,
        filename,
        bytes,
    })
}

/// Decompressed JSON text of a document
pub fn extract_payload(html: &str) -> Result<String, AppError> {
    let caps = IFRAME_FRAGMENT
        .captures(html)
        .ok_or_else(|| AppError::Decode("no iframe payload".to_string()))?;

    let fragment = urlencoding::decode(&caps[1])
        .map_err(|e| AppError::Decode(format!("fragment is not valid UTF-8: {}", e)))?;

    let wide = lz_str::decompress_from_encoded_uri_component(fragment.as_ref())
        .ok_or_else(|| AppError::Decode("LZ-String decompression failed".to_string()))?;

    String::from_utf16(&wide)
        .map_err(|e| AppError::Decode(format!("payload is not valid UTF-16: {}", e)))
}

/// Decode a fetched document into its torrent triples. Entries without a
/// hash are dropped; everything else is left to the caller to validate.
pub fn decode_document(html: &str) -> Result<Vec<TorrentTriple>, AppError> {
    let json = extract_payload(html)?;
    let payload: Payload = serde_json::from_str(json.trim())
        .map_err(|e| AppError::Decode(format!("payload JSON: {}", e)))?;

    let entries = match payload {
        Payload::Titled { torrents } => torrents,
        Payload::Bare(torrents) => torrents,
    };
    Ok(entries.iter().filter_map(triple_from_value).collect())
}

/// Builds a document the way the feed publishes them
#[cfg(test)]
pub fn encode_document(json: &str) -> String {
    let compressed = lz_str::compress_to_encoded_uri_component(json);
    format!(
        r#"<html><body><iframe width="100%" src="https://debridmediamanager.com/hashlist#{}"></iframe></body></html>"#,
        compressed
    )
}
