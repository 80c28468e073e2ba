//! Periodic manifest reconciliation.
//!
//! Two idempotent passes repair on-disk adaptive-stream state after crashes
//! or interrupted live streams:
//!
//! 1. Close dangling live manifests: media playlists of streamed videos
//!    that are missing the stream-termination marker get it appended.
//! 2. Prune orphan master manifests: an adaptive directory containing only
//!    the master playlist (the video was deleted or never had segments)
//!    has that master removed so broken renditions are never served.
//!
//! Missing directories and partial filesystem state are skipped, not
//! propagated: the check itself is the recovery, and the next tick
//! self-heals whatever this one could not.

use std::sync::Arc;

use tokio::fs;
use tracing::{debug, warn};

use super::{ManifestLayout, MASTER_MANIFEST, RENDITIONS, STREAM_TERMINATION_MARKER};
use crate::database::repositories::VideoRepository;

/// Periodic background task repairing on-disk manifest state.
///
/// The coordinator drives [`Reconciler::tick`] inline on a timer in its own
/// execution context; ticks never go through the write-job queue since no
/// cross-worker contention exists for them.
pub struct Reconciler {
    layout: ManifestLayout,
    repository: Arc<dyn VideoRepository>,
    record_streams: bool,
}

impl Reconciler {
    pub fn new(
        layout: ManifestLayout,
        repository: Arc<dyn VideoRepository>,
        record_streams: bool,
    ) -> Self {
        Self {
            layout,
            repository,
            record_streams,
        }
    }

    /// Run both reconciliation passes once.
    ///
    /// Errors are logged per video and never escape; the next tick retries.
    pub async fn tick(&self) {
        if self.record_streams {
            self.close_dangling_manifests().await;
        }
        self.prune_orphan_masters().await;
    }

    /// Pass 1: append the termination marker to media playlists of streamed
    /// videos that were left open by an interrupted live stream.
    ///
    /// Idempotent: an already-closed playlist is left untouched, so a
    /// second run on identical state is byte-identical.
    async fn close_dangling_manifests(&self) {
        let ids = match self.repository.list_streamed_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Reconciler could not list streamed videos; skipping pass");
                return;
            }
        };

        for video_id in ids {
            for rendition in &RENDITIONS {
                let path = self.layout.rendition_manifest(&video_id, rendition);
                let contents = match fs::read_to_string(&path).await {
                    Ok(contents) => contents,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        warn!(
                            video_id = %video_id,
                            path = %path.display(),
                            error = %e,
                            "Reconciler could not read manifest; skipping"
                        );
                        continue;
                    }
                };

                if contents.contains(STREAM_TERMINATION_MARKER) {
                    continue;
                }

                let mut closed = contents;
                if !closed.ends_with('\n') {
                    closed.push('\n');
                }
                closed.push_str(STREAM_TERMINATION_MARKER);
                closed.push('\n');

                if let Err(e) = fs::write(&path, closed).await {
                    warn!(
                        video_id = %video_id,
                        path = %path.display(),
                        error = %e,
                        "Reconciler could not close manifest; skipping"
                    );
                } else {
                    debug!(
                        video_id = %video_id,
                        rendition = rendition.name,
                        "Closed dangling live manifest"
                    );
                }
            }
        }
    }

    /// Pass 2: delete master manifests whose adaptive directory holds
    /// nothing else.
    ///
    /// Walks the media tree rather than the store so directories of
    /// already-deleted videos are covered too.
    async fn prune_orphan_masters(&self) {
        let mut videos = match fs::read_dir(self.layout.videos_root()).await {
            Ok(videos) => videos,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(error = %e, "Reconciler could not read videos root; skipping pass");
                return;
            }
        };

        while let Ok(Some(entry)) = videos.next_entry().await {
            let video_id = entry.file_name().to_string_lossy().to_string();
            let adaptive_dir = self.layout.adaptive_dir(&video_id);

            let mut entries = match fs::read_dir(&adaptive_dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            let mut only_master = false;
            let mut count = 0usize;
            while let Ok(Some(child)) = entries.next_entry().await {
                count += 1;
                if count > 1 {
                    only_master = false;
                    break;
                }
                only_master = child.file_name().to_string_lossy() == MASTER_MANIFEST;
            }

            if count == 1 && only_master {
                let master = self.layout.master_manifest(&video_id);
                if let Err(e) = fs::remove_file(&master).await {
                    warn!(
                        video_id = %video_id,
                        error = %e,
                        "Reconciler could not prune orphan master manifest"
                    );
                } else {
                    debug!(video_id = %video_id, "Pruned orphan master manifest");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use crate::database::models::{VideoDbModel, VideoFlags};
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    struct StubRepository {
        streamed: Vec<String>,
    }

    #[async_trait]
    impl VideoRepository for StubRepository {
        async fn find_by_id(&self, _video_id: &str) -> Result<Option<VideoDbModel>> {
            Ok(None)
        }

        async fn flags(&self, _video_id: &str) -> Result<Option<VideoFlags>> {
            Ok(None)
        }

        async fn exists(&self, _video_id: &str) -> Result<bool> {
            Ok(false)
        }

        async fn list_streamed_ids(&self) -> Result<Vec<String>> {
            Ok(self.streamed.clone())
        }
    }

    fn reconciler(root: &Path, streamed: &[&str]) -> Reconciler {
        Reconciler::new(
            ManifestLayout::new(root),
            Arc::new(StubRepository {
                streamed: streamed.iter().map(|s| s.to_string()).collect(),
            }),
            true,
        )
    }

    async fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(path, contents).await.unwrap();
    }

    #[tokio::test]
    async fn test_closes_dangling_manifest_once() {
        let dir = TempDir::new().unwrap();
        let rec = reconciler(dir.path(), &["abc12345678"]);
        let layout = ManifestLayout::new(dir.path());
        let r720 = RENDITIONS.iter().find(|r| r.name == "720p").unwrap();
        let path = layout.rendition_manifest("abc12345678", r720);

        write(&path, "#EXTM3U\n#EXTINF:4.0,\nsegment-720p-0.ts\n").await;

        rec.tick().await;
        let closed = fs::read_to_string(&path).await.unwrap();
        assert!(closed.ends_with("#EXT-X-ENDLIST\n"));

        // Second run on identical state is byte-identical.
        rec.tick().await;
        let again = fs::read_to_string(&path).await.unwrap();
        assert_eq!(closed, again);
    }

    #[tokio::test]
    async fn test_close_adds_missing_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let rec = reconciler(dir.path(), &["abc12345678"]);
        let layout = ManifestLayout::new(dir.path());
        let r240 = &RENDITIONS[0];
        let path = layout.rendition_manifest("abc12345678", r240);

        write(&path, "#EXTM3U\nsegment-240p-0.ts").await;

        rec.tick().await;
        let closed = fs::read_to_string(&path).await.unwrap();
        assert!(closed.contains("segment-240p-0.ts\n#EXT-X-ENDLIST\n"));
    }

    #[tokio::test]
    async fn test_prunes_orphan_master() {
        let dir = TempDir::new().unwrap();
        let rec = reconciler(dir.path(), &[]);
        let layout = ManifestLayout::new(dir.path());
        let master = layout.master_manifest("abc12345678");

        write(&master, "#EXTM3U\n").await;

        rec.tick().await;
        assert!(!master.exists());
    }

    #[tokio::test]
    async fn test_keeps_master_with_renditions_present() {
        let dir = TempDir::new().unwrap();
        let rec = reconciler(dir.path(), &[]);
        let layout = ManifestLayout::new(dir.path());
        let master = layout.master_manifest("abc12345678");
        let r720 = RENDITIONS.iter().find(|r| r.name == "720p").unwrap();

        write(&master, "#EXTM3U\n").await;
        write(
            &layout.rendition_manifest("abc12345678", r720),
            "#EXTM3U\n#EXT-X-ENDLIST\n",
        )
        .await;

        rec.tick().await;
        assert!(master.exists());
    }

    #[tokio::test]
    async fn test_tolerates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let rec = reconciler(&dir.path().join("does-not-exist"), &["abc12345678"]);
        // Must not panic or error.
        rec.tick().await;
    }
}
