//! Video database model.

use rand::RngExt;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::Result;

/// Length of a video identifier.
pub const VIDEO_ID_LEN: usize = 11;

/// Restricted alphabet video identifiers are drawn from.
const VIDEO_ID_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-";

/// Maximum number of tags per video.
const MAX_TAGS: usize = 5;

/// Maximum length of a single tag.
const MAX_TAG_LEN: usize = 30;

/// Generate a new 11-character opaque video identifier.
///
/// Identifiers are immutable once assigned; callers must re-check
/// uniqueness against the store at insert time.
pub fn generate_video_id() -> String {
    let mut rng = rand::rng();
    (0..VIDEO_ID_LEN)
        .map(|_| {
            let idx = rng.random_range(0..VIDEO_ID_ALPHABET.len());
            VIDEO_ID_ALPHABET[idx] as char
        })
        .collect()
}

/// Validate and join tags into their comma-joined storage form.
///
/// At most 5 tags, each at most 30 characters, none empty and none
/// containing the joining comma.
pub fn normalize_tags(tags: &[String]) -> Result<String> {
    if tags.len() > MAX_TAGS {
        return Err(crate::Error::validation(format!(
            "at most {} tags allowed, got {}",
            MAX_TAGS,
            tags.len()
        )));
    }
    for tag in tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::validation("empty tag"));
        }
        if trimmed.len() > MAX_TAG_LEN {
            return Err(crate::Error::validation(format!(
                "tag '{}' exceeds {} characters",
                trimmed, MAX_TAG_LEN
            )));
        }
        if trimmed.contains(',') {
            return Err(crate::Error::validation(format!(
                "tag '{}' contains a comma",
                trimmed
            )));
        }
    }
    Ok(tags
        .iter()
        .map(|t| t.trim())
        .collect::<Vec<_>>()
        .join(","))
}

/// Video database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VideoDbModel {
    /// 11-character opaque identifier, immutable.
    pub video_id: String,
    pub title: String,
    pub description: String,
    /// Comma-joined tags (see [`normalize_tags`]).
    pub tags: String,
    pub source_file_extension: String,
    /// Opaque metadata blob (e.g. stream port / session id).
    pub meta: String,

    // lifecycle flags
    pub importing: bool,
    pub imported: bool,
    pub publishing: bool,
    pub published: bool,
    pub streaming: bool,
    pub streamed: bool,
    pub live: bool,
    pub indexed: bool,
    pub index_outdated: bool,
    pub error: bool,
    pub finalized: bool,

    // metrics
    pub views: i64,
    pub likes: i64,
    pub dislikes: i64,
    pub comments: i64,
    /// Monotonically non-decreasing byte counter.
    pub bandwidth: i64,
    pub length_seconds: i64,
    pub length_timestamp: String,

    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

impl VideoDbModel {
    /// Snapshot of the lifecycle flags.
    pub fn flags(&self) -> VideoFlags {
        VideoFlags {
            importing: self.importing,
            imported: self.imported,
            publishing: self.publishing,
            published: self.published,
            streaming: self.streaming,
            streamed: self.streamed,
            live: self.live,
            indexed: self.indexed,
            index_outdated: self.index_outdated,
            error: self.error,
            finalized: self.finalized,
        }
    }

    /// Get the tags as a Vec<String>.
    pub fn get_tags(&self) -> Vec<String> {
        if self.tags.is_empty() {
            return Vec::new();
        }
        self.tags.split(',').map(|t| t.to_string()).collect()
    }
}

/// Lifecycle flag snapshot of one video.
///
/// A video is in at most one processing phase (importing, publishing,
/// streaming) at any instant; `index_outdated` implies `indexed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoFlags {
    pub importing: bool,
    pub imported: bool,
    pub publishing: bool,
    pub published: bool,
    pub streaming: bool,
    pub streamed: bool,
    pub live: bool,
    pub indexed: bool,
    pub index_outdated: bool,
    pub error: bool,
    pub finalized: bool,
}

impl VideoFlags {
    /// Whether any processing phase is active.
    pub fn phase_active(&self) -> bool {
        self.importing || self.publishing || self.streaming
    }

    /// Number of processing phases currently set. Must never exceed 1.
    pub fn active_phase_count(&self) -> usize {
        [self.importing, self.publishing, self.streaming]
            .iter()
            .filter(|f| **f)
            .count()
    }

    /// Whether the row may be deleted: no active phase and not indexed.
    pub fn deletable(&self) -> bool {
        !self.phase_active() && !self.indexed
    }
}
