//! Real-Debrid REST payloads

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use crate::models::InfoHash;

/// One file inside a cached variant
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CachedFile {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub filesize: u64,
}

/// A set of files the provider already holds for a hash, keyed by file id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedVariant {
    pub files: BTreeMap<u32, CachedFile>,
}

/// Hashes reported instantly available, with their cached variants
pub type AvailabilityMap = HashMap<InfoHash, Vec<CachedVariant>>;

#[derive(Debug, Clone, Deserialize)]
pub struct AddedTorrent {
    pub id: String,
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TorrentFile {
    pub id: u32,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub selected: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TorrentInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub files: Vec<TorrentFile>,
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnrestrictedLink {
    #[serde(default)]
    pub download: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub filesize: u64,
}

/// Parses `{ "<hash>": { "rd": [ { "<fileId>": {filename, filesize} } ] } }`.
///
/// Uncached hashes come back as `[]` or with an empty `rd` list and are left
/// out. Entries that do not fit the shape are skipped.
pub fn parse_instant_availability(body: &serde_json::Value) -> AvailabilityMap {
    let mut available = AvailabilityMap::new();
    let Some(entries) = body.as_object() else {
        return available;
    };

    for (raw_hash, entry) in entries {
        let Some(hash) = InfoHash::parse(raw_hash) else {
            continue;
        };
        let Some(variants) = entry.get("rd").and_then(|rd| rd.as_array()) else {
            continue;
        };

        let parsed: Vec<CachedVariant> = variants
            .iter()
            .filter_map(|variant| variant.as_object())
            .map(|files| CachedVariant {
                files: files
                    .iter()
                    .filter_map(|(id, file)| {
                        let id = id.parse::<u32>().ok()?;
                        let file = serde_json::from_value::<CachedFile>(file.clone()).ok()?;
                        Some((id, file))
                    })
                    .collect(),
            })
            .filter(|variant| !variant.files.is_empty())
            .collect();

        if !parsed.is_empty() {
            available.insert(hash, parsed);
        }
    }
    available
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_instant_availability_keeps_only_cached() {
        let cached = "a".repeat(40);
        let empty_rd = "b".repeat(40);
        let empty_list = "c".repeat(40);
        let body = json!({
            cached.clone(): { "rd": [ { "1": { "filename": "Movie.mkv", "filesize": 1234 } } ] },
            empty_rd: { "rd": [] },
            empty_list: [],
            "not-a-hash": { "rd": [ { "1": { "filename": "x", "filesize": 1 } } ] }
        });

        let available = parse_instant_availability(&body);
        assert_eq!(available.len(), 1);

        let variants = &available[&InfoHash::parse(&cached).unwrap()];
        assert_eq!(variants[0].files[&1].filename, "Movie.mkv");
        assert_eq!(variants[0].files[&1].filesize, 1234);
    }

    #[test]
    fn test_parse_instant_availability_tolerates_garbage() {
        assert!(parse_instant_availability(&json!([])).is_empty());
        assert!(parse_instant_availability(&json!("error")).is_empty());
    }
}
