//! Video repository for read-side database access.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{VideoDbModel, VideoFlags};

/// Video repository trait for read-only data access.
#[async_trait]
pub trait VideoRepository: Send + Sync {
    /// Find a video by its identifier.
    async fn find_by_id(&self, video_id: &str) -> Result<Option<VideoDbModel>>;

    /// Fetch only the lifecycle flag snapshot of a video.
    async fn flags(&self, video_id: &str) -> Result<Option<VideoFlags>>;

    /// Whether a video with this identifier exists.
    async fn exists(&self, video_id: &str) -> Result<bool>;

    /// List identifiers of videos whose live stream has ended.
    async fn list_streamed_ids(&self) -> Result<Vec<String>>;
}

/// SQLx implementation of [`VideoRepository`].
pub struct SqlxVideoRepository {
    pool: SqlitePool,
}

impl SqlxVideoRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VideoRepository for SqlxVideoRepository {
    async fn find_by_id(&self, video_id: &str) -> Result<Option<VideoDbModel>> {
        let video = sqlx::query_as::<_, VideoDbModel>("SELECT * FROM videos WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(video)
    }

    async fn flags(&self, video_id: &str) -> Result<Option<VideoFlags>> {
        Ok(self.find_by_id(video_id).await?.map(|v| v.flags()))
    }

    async fn exists(&self, video_id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM videos WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_streamed_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT video_id FROM videos WHERE streamed = 1 ORDER BY video_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
