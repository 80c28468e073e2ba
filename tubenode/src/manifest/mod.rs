//! Adaptive-stream manifest handling.
//!
//! This module owns the on-disk manifest layout
//! (`videos/{id}/adaptive/m3u8/...`), the fixed rendition table, and the
//! master manifest assembly. Consistency of the tree is enforced by the
//! [`reconciler`], not by transactional means.

pub mod reconciler;

pub use reconciler::Reconciler;

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::Result;

/// Marker appended to a media playlist when its stream has terminated.
pub const STREAM_TERMINATION_MARKER: &str = "#EXT-X-ENDLIST";

/// File name of the per-video master manifest.
pub const MASTER_MANIFEST: &str = "manifest-master.m3u8";

/// One resolution/bitrate variant of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendition {
    pub name: &'static str,
    pub bandwidth: u32,
    pub width: u32,
    pub height: u32,
}

impl Rendition {
    /// File name of this rendition's media playlist.
    pub fn manifest_name(&self) -> String {
        format!("manifest-{}.m3u8", self.name)
    }
}

/// Fixed bandwidth/resolution table, in ascending quality order.
pub const RENDITIONS: [Rendition; 7] = [
    Rendition {
        name: "240p",
        bandwidth: 250_000,
        width: 426,
        height: 240,
    },
    Rendition {
        name: "360p",
        bandwidth: 500_000,
        width: 640,
        height: 360,
    },
    Rendition {
        name: "480p",
        bandwidth: 1_000_000,
        width: 854,
        height: 480,
    },
    Rendition {
        name: "720p",
        bandwidth: 3_000_000,
        width: 1280,
        height: 720,
    },
    Rendition {
        name: "1080p",
        bandwidth: 6_000_000,
        width: 1920,
        height: 1080,
    },
    Rendition {
        name: "1440p",
        bandwidth: 10_000_000,
        width: 2560,
        height: 1440,
    },
    Rendition {
        name: "2160p",
        bandwidth: 16_000_000,
        width: 3840,
        height: 2160,
    },
];

/// Per-video filesystem layout rooted at the configured data directory.
///
/// `videos/{id}/adaptive/m3u8/manifest-{res}.m3u8`
/// `videos/{id}/adaptive/m3u8/{res}/segment-{res}-{n}.ts`
/// `videos/{id}/adaptive/m3u8/manifest-master.m3u8`
/// `videos/{id}/progressive/{fmt}/{res}/{res}.{fmt}`
#[derive(Debug, Clone)]
pub struct ManifestLayout {
    videos_root: PathBuf,
}

impl ManifestLayout {
    pub fn new(videos_root: impl Into<PathBuf>) -> Self {
        Self {
            videos_root: videos_root.into(),
        }
    }

    pub fn videos_root(&self) -> &Path {
        &self.videos_root
    }

    /// Root of one video's media tree.
    pub fn video_dir(&self, video_id: &str) -> PathBuf {
        self.videos_root.join(video_id)
    }

    /// Directory holding the adaptive playlists and segment subdirectories.
    pub fn adaptive_dir(&self, video_id: &str) -> PathBuf {
        self.video_dir(video_id).join("adaptive").join("m3u8")
    }

    pub fn rendition_manifest(&self, video_id: &str, rendition: &Rendition) -> PathBuf {
        self.adaptive_dir(video_id).join(rendition.manifest_name())
    }

    pub fn master_manifest(&self, video_id: &str) -> PathBuf {
        self.adaptive_dir(video_id).join(MASTER_MANIFEST)
    }

    pub fn segment(&self, video_id: &str, rendition: &Rendition, index: u64) -> PathBuf {
        self.adaptive_dir(video_id)
            .join(rendition.name)
            .join(format!("segment-{}-{}.ts", rendition.name, index))
    }

    pub fn progressive(&self, video_id: &str, format: &str, rendition: &Rendition) -> PathBuf {
        self.video_dir(video_id)
            .join("progressive")
            .join(format)
            .join(rendition.name)
            .join(format!("{}.{}", rendition.name, format))
    }
}

/// Rebuild a video's master manifest from the renditions present on disk.
///
/// Full rebuild, not an incremental patch: the adaptive directory is
/// scanned for present per-resolution playlists and the master is rewritten
/// with one `#EXT-X-STREAM-INF` entry per present rendition in ascending
/// quality order. Safe to call redundantly.
pub async fn rebuild_master(layout: &ManifestLayout, video_id: &str) -> Result<Vec<&'static str>> {
    let dir = layout.adaptive_dir(video_id);
    let mut present = Vec::new();

    let mut contents = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for rendition in &RENDITIONS {
        let manifest = dir.join(rendition.manifest_name());
        if fs::try_exists(&manifest).await.unwrap_or(false) {
            contents.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}\n",
                rendition.bandwidth,
                rendition.width,
                rendition.height,
                rendition.manifest_name()
            ));
            present.push(rendition.name);
        }
    }

    fs::create_dir_all(&dir).await?;
    fs::write(dir.join(MASTER_MANIFEST), contents).await?;

    tracing::debug!(
        video_id = %video_id,
        renditions = present.len(),
        "Master manifest rebuilt"
    );

    Ok(present)
}
