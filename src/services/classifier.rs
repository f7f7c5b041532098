use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

use crate::models::{HashType, Quality, StreamCandidate};

lazy_static! {
    // ============ QUALITY PATTERNS (checked best-first) ============
    static ref QUALITY_2160: Regex =
        Regex::new(r"(?i)2160p|(?:^|[^a-z0-9])(?:4k|uhd)(?:[^a-z0-9]|$)").unwrap();
    static ref QUALITY_1080: Regex = Regex::new(r"(?i)1080p").unwrap();
    static ref QUALITY_720: Regex = Regex::new(r"(?i)720p").unwrap();
    static ref QUALITY_480: Regex = Regex::new(r"(?i)480p").unwrap();

    // ============ TYPE PATTERNS ============
    static ref EPISODE_PATTERN: Regex = Regex::new(r"(?i)S\d{1,2}[\s._-]?E\d{1,3}").unwrap();
    static ref SERIES_PATTERN: Regex =
        Regex::new(r"(?i)\bSeason\b|\bComplete\b|(?:^|[^a-z0-9])S\d{1,2}(?:[^a-z0-9]|$)").unwrap();

    // ============ SIZE ============
    static ref SIZE_MARKED: Regex = Regex::new(r"(?i)💾\s*([\d.]+)\s*(TB|GB|MB|KB)").unwrap();
    static ref SIZE_GENERIC: Regex = Regex::new(r"(?i)([\d.]+)\s*(TB|GB|MB|KB)\b").unwrap();

    // ============ MULTI-MOVIE PACKS ============
    static ref COLLECTION_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\d+\s*Movies?\s*(Collection|Pack|Part)").unwrap(),
        Regex::new(r"(?i)Collection.*\d+.*Movies?").unwrap(),
        Regex::new(r"(?i)IMDB\s*Top\s*\d+").unwrap(),
        Regex::new(r"(?i)Top\s*\d+\s*Movies?").unwrap(),
        Regex::new(r"(?i)\bPack\b.*\d+\s*(Movies?|Films?)").unwrap(),
        Regex::new(r"(?i)\d+\s*(Classic|Best|Greatest)\s*(Movies?|Films?)").unwrap(),
        Regex::new(r"(?i)Fanedit\s*Collection").unwrap(),
        Regex::new(r"(?i)Movies?\s*Collection\s*\d+").unwrap(),
    ];
}

/// Release-title classification and candidate ordering.
/// Every function here is pure.
pub struct QualityClassifier;

impl QualityClassifier {
    /// Quality tier of a release title or filename; the best matching tier wins
    pub fn classify_quality(title: &str) -> Quality {
        if QUALITY_2160.is_match(title) {
            Quality::P2160
        } else if QUALITY_1080.is_match(title) {
            Quality::P1080
        } else if QUALITY_720.is_match(title) {
            Quality::P720
        } else if QUALITY_480.is_match(title) {
            Quality::P480
        } else {
            Quality::Unknown
        }
    }

    /// Episode marker beats season marker beats movie
    pub fn classify_type(filename: &str) -> HashType {
        if EPISODE_PATTERN.is_match(filename) {
            HashType::Episode
        } else if SERIES_PATTERN.is_match(filename) {
            HashType::Series
        } else {
            HashType::Movie
        }
    }

    pub fn classify(filename: &str) -> (HashType, Quality) {
        (
            Self::classify_type(filename),
            Self::classify_quality(filename),
        )
    }

    /// Size in bytes from a listing title ("💾 12.3 GB"); 0 when absent
    pub fn parse_size_bytes(title: &str) -> u64 {
        let caps = SIZE_MARKED
            .captures(title)
            .or_else(|| SIZE_GENERIC.captures(title));

        let Some(caps) = caps else {
            return 0;
        };
        let Ok(value) = caps[1].parse::<f64>() else {
            return 0;
        };
        let multiplier = match caps[2].to_ascii_uppercase().as_str() {
            "TB" => 1024f64.powi(4),
            "GB" => 1024f64.powi(3),
            "MB" => 1024f64.powi(2),
            _ => 1024f64,
        };
        (value * multiplier) as u64
    }

    /// Multi-movie packs never play the requested title
    pub fn is_collection_pack(title: &str) -> bool {
        COLLECTION_PATTERNS.iter().any(|p| p.is_match(title))
    }

    /// Stable: quality desc, then size desc, then discovery order
    pub fn sort_by_quality(mut candidates: Vec<StreamCandidate>) -> Vec<StreamCandidate> {
        candidates.sort_by(|a, b| {
            b.quality
                .rank()
                .cmp(&a.quality.rank())
                .then_with(|| b.size_bytes.cmp(&a.size_bytes))
        });
        candidates
    }

    pub fn filter_by_resolution_ceiling(
        candidates: Vec<StreamCandidate>,
        max_resolution: Quality,
    ) -> Vec<StreamCandidate> {
        candidates
            .into_iter()
            .filter(|c| c.quality.rank() <= max_resolution.rank())
            .collect()
    }

    pub fn filter_excluded(
        candidates: Vec<StreamCandidate>,
        exclude: Option<&Regex>,
    ) -> Vec<StreamCandidate> {
        match exclude {
            Some(pattern) => candidates
                .into_iter()
                .filter(|c| !pattern.is_match(&c.title))
                .collect(),
            None => candidates,
        }
    }

    pub fn filter_collection_packs(candidates: Vec<StreamCandidate>) -> Vec<StreamCandidate> {
        candidates
            .into_iter()
            .filter(|c| !Self::is_collection_pack(&c.title))
            .collect()
    }

    /// First sighting of each hash wins
    pub fn dedupe_by_hash(candidates: Vec<StreamCandidate>) -> Vec<StreamCandidate> {
        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|c| seen.insert(c.hash.clone()))
            .collect()
    }

    /// Full pipeline: exclude → drop packs → dedupe → sort → resolution ceiling
    pub fn prepare(
        candidates: Vec<StreamCandidate>,
        max_resolution: Quality,
        exclude: Option<&Regex>,
    ) -> Vec<StreamCandidate> {
        let candidates = Self::filter_excluded(candidates, exclude);
        let candidates = Self::filter_collection_packs(candidates);
        let candidates = Self::dedupe_by_hash(candidates);
        let candidates = Self::sort_by_quality(candidates);
        Self::filter_by_resolution_ceiling(candidates, max_resolution)
    }
}
