//! Lifecycle transition service.
//!
//! The REST layer hands this service validated `(operation, video_id)`
//! tuples; it checks the transition against the current flag snapshot,
//! submits the single write job through its worker, and emits the
//! transition's broadcast once the write is confirmed. Informational
//! progress events skip the store entirely.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::bus::SqlValue;
use crate::database::models::{generate_video_id, normalize_tags};
use crate::database::repositories::VideoRepository;
use crate::error::Result;
use crate::lifecycle::rules::Transition;
use crate::manifest::ManifestLayout;
use crate::upload::UploadTracker;
use crate::worker::WorkerHandle;

/// Descriptive fields for a row-creating operation.
#[derive(Debug, Clone, Default)]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub source_file_extension: String,
    pub meta: String,
}

/// Applies lifecycle transitions for the videos this worker handles.
#[derive(Clone)]
pub struct LifecycleService {
    worker: WorkerHandle,
    repository: Arc<dyn VideoRepository>,
    uploads: UploadTracker,
    layout: ManifestLayout,
}

impl LifecycleService {
    pub fn new(
        worker: WorkerHandle,
        repository: Arc<dyn VideoRepository>,
        uploads: UploadTracker,
        layout: ManifestLayout,
    ) -> Self {
        Self {
            worker,
            repository,
            uploads,
            layout,
        }
    }

    /// Start importing a new video. Returns the generated identifier.
    pub async fn start_import(&self, new: NewVideo) -> Result<String> {
        let video_id = self.insert_video(new, false).await?;
        self.worker
            .broadcast("importing", json!({ "videoId": video_id }))
            .await?;
        Ok(video_id)
    }

    pub async fn complete_import(&self, video_id: &str) -> Result<()> {
        self.apply(video_id, Transition::CompleteImport).await?;
        self.worker
            .broadcast("imported", json!({ "videoId": video_id }))
            .await
    }

    pub async fn stop_import(&self, video_id: &str) -> Result<()> {
        self.check(video_id, Transition::StopImport).await?;
        self.worker
            .broadcast("importing_stopping", json!({ "videoId": video_id }))
            .await?;
        self.submit(video_id, Transition::StopImport).await?;
        self.worker
            .broadcast("importing_stopped", json!({ "videoId": video_id }))
            .await
    }

    pub async fn start_publish(&self, video_id: &str) -> Result<()> {
        self.apply(video_id, Transition::StartPublish).await
    }

    /// Report upload progress for a publishing video.
    ///
    /// Purely informational: no store access. Progress is rate-limited per
    /// video and suppressed once the upload is stopping; the terminal 100%
    /// broadcast always goes out.
    pub async fn publish_progress(&self, video_id: &str, percent: f64) -> Result<()> {
        if self.uploads.chunk(video_id, percent).await? {
            self.worker
                .broadcast(
                    "publishing",
                    json!({ "videoId": video_id, "progress": percent }),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn complete_publish(&self, video_id: &str) -> Result<()> {
        self.apply(video_id, Transition::CompletePublish).await?;
        self.worker
            .broadcast("published", json!({ "videoId": video_id }))
            .await
    }

    /// Stop an in-flight publish.
    ///
    /// The `publishing_stopped` broadcast doubles as the destroy signal for
    /// the video's tracked upload requests: the upload tracker observes it
    /// from whichever worker it is delivered to.
    pub async fn stop_publish(&self, video_id: &str) -> Result<()> {
        self.check(video_id, Transition::StopPublish).await?;
        self.worker
            .broadcast("publishing_stopping", json!({ "videoId": video_id }))
            .await?;
        self.submit(video_id, Transition::StopPublish).await?;
        self.worker
            .broadcast("publishing_stopped", json!({ "videoId": video_id }))
            .await
    }

    /// Start a live stream: inserts a new row already in the streaming
    /// phase and announces the new entity.
    pub async fn start_live_stream(&self, new: NewVideo) -> Result<String> {
        let title = new.title.clone();
        let video_id = self.insert_video(new, true).await?;
        self.worker
            .broadcast(
                "video_data",
                json!({ "videoId": video_id, "title": title, "live": true }),
            )
            .await?;
        Ok(video_id)
    }

    /// Stop a live stream and delete its manifest directory.
    pub async fn stop_live_stream(&self, video_id: &str) -> Result<()> {
        self.check(video_id, Transition::StopLiveStream).await?;
        self.worker
            .broadcast("streaming_stopping", json!({ "videoId": video_id }))
            .await?;
        self.submit(video_id, Transition::StopLiveStream).await?;

        let manifest_dir = self.layout.adaptive_dir(video_id);
        match tokio::fs::remove_dir_all(&manifest_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                // The reconciler repairs leftover manifests on its next tick.
                tracing::warn!(
                    video_id = %video_id,
                    error = %e,
                    "Could not delete manifest directory"
                );
            }
        }

        self.worker
            .broadcast("streaming_stopped", json!({ "videoId": video_id }))
            .await
    }

    /// Flag a video as errored. No broadcast.
    pub async fn mark_error(&self, video_id: &str) -> Result<()> {
        self.apply_unchecked(video_id, Transition::MarkError).await
    }

    pub async fn finalize(&self, video_id: &str) -> Result<()> {
        self.apply(video_id, Transition::Finalize).await?;
        self.worker
            .broadcast("finalized", json!({ "videoId": video_id }))
            .await
    }

    /// Delete a video row. Only legal when no processing phase is active
    /// and the video is not indexed.
    pub async fn delete_video(&self, video_id: &str) -> Result<()> {
        self.apply(video_id, Transition::Delete).await
    }

    /// A rendition's segment upload finished: rebuild the video's master
    /// manifest from what is present on disk.
    ///
    /// Full rebuild, safe to call redundantly. Returns the rendition names
    /// the rebuilt master references.
    pub async fn complete_segment_upload(&self, video_id: &str) -> Result<Vec<&'static str>> {
        crate::manifest::rebuild_master(&self.layout, video_id).await
    }

    /// Add served bytes to a video's monotone bandwidth counter.
    pub async fn add_bandwidth(&self, video_id: &str, bytes: i64) -> Result<()> {
        self.worker
            .submit_write(
                "UPDATE videos SET bandwidth = bandwidth + ? WHERE video_id = ?",
                vec![SqlValue::Integer(bytes), video_id.into()],
            )
            .await
    }

    async fn insert_video(&self, new: NewVideo, live: bool) -> Result<String> {
        let tags = normalize_tags(&new.tags)?;

        // Re-check uniqueness against the store; identifiers are immutable
        // once assigned.
        let mut video_id = generate_video_id();
        while self.repository.exists(&video_id).await? {
            video_id = generate_video_id();
        }

        let (importing, streaming) = if live { (0, 1) } else { (1, 0) };
        self.worker
            .submit_write(
                "INSERT INTO videos (video_id, title, description, tags, \
                 source_file_extension, meta, importing, live, streaming, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                vec![
                    video_id.clone().into(),
                    new.title.into(),
                    new.description.into(),
                    tags.into(),
                    new.source_file_extension.into(),
                    new.meta.into(),
                    SqlValue::Integer(importing),
                    SqlValue::Integer(if live { 1 } else { 0 }),
                    SqlValue::Integer(streaming),
                    Utc::now().to_rfc3339().into(),
                ],
            )
            .await?;

        Ok(video_id)
    }

    /// Validate the precondition, then issue the single write job.
    async fn apply(&self, video_id: &str, transition: Transition) -> Result<()> {
        self.check(video_id, transition).await?;
        self.submit(video_id, transition).await
    }

    /// Issue the write without a flag precondition (mark error is legal in
    /// any state, but the row must exist).
    async fn apply_unchecked(&self, video_id: &str, transition: Transition) -> Result<()> {
        if !self.repository.exists(video_id).await? {
            return Err(crate::Error::VideoNotFound(video_id.to_string()));
        }
        self.submit(video_id, transition).await
    }

    async fn check(&self, video_id: &str, transition: Transition) -> Result<()> {
        let flags = self
            .repository
            .flags(video_id)
            .await?
            .ok_or_else(|| crate::Error::VideoNotFound(video_id.to_string()))?;
        transition
            .check(&flags)
            .map_err(|reason| crate::Error::invalid_transition(video_id, reason))
    }

    async fn submit(&self, video_id: &str, transition: Transition) -> Result<()> {
        self.worker
            .submit_write(transition.statement(), vec![video_id.into()])
            .await
    }
}
