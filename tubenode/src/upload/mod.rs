//! Upload tracking and cancellation.
//!
//! Long-running chunked uploads must be cancelable from a concurrent
//! control-plane signal that may originate on any worker. The tracker is a
//! small actor owning the map from video id to its in-flight upload
//! sessions; all access goes through a single command channel, so there is
//! no shared mutable state to race on.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Minimum gap between progress broadcasts for one video.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Command channel capacity.
const COMMAND_CAPACITY: usize = 256;

/// One video's in-flight upload state.
struct UploadSession {
    /// Abort handles of the currently open upload requests.
    handles: Vec<CancellationToken>,
    /// Set once a stop has been observed; checked on every chunk.
    stopping: bool,
    /// When the last progress broadcast was allowed through.
    last_progress: Option<Instant>,
}

enum Command {
    Register {
        video_id: String,
        handle: CancellationToken,
    },
    Chunk {
        video_id: String,
        percent: f64,
        reply: oneshot::Sender<bool>,
    },
    MarkStopping {
        video_id: String,
    },
    Stop {
        video_id: String,
    },
}

/// Handle to the upload tracker actor.
#[derive(Clone)]
pub struct UploadTracker {
    commands: mpsc::Sender<Command>,
}

impl UploadTracker {
    /// Spawn the tracker actor and return a handle to it.
    pub fn spawn() -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(run(rx));
        Self { commands }
    }

    /// Track one upload request for a video.
    ///
    /// The first registration for a video id creates its session; the
    /// handle is aborted if a stop signal arrives while the request is in
    /// flight. Aborting an already-finished request is a no-op.
    pub async fn register(&self, video_id: &str, handle: CancellationToken) -> Result<()> {
        self.commands
            .send(Command::Register {
                video_id: video_id.to_string(),
                handle,
            })
            .await
            .map_err(|_| crate::Error::BusClosed("upload tracker stopped"))
    }

    /// Report one received chunk; returns whether a progress broadcast
    /// should be emitted for it.
    ///
    /// Checked on every chunk rather than once: a stop signal racing the
    /// chunk suppresses the broadcast regardless of interleaving. Progress
    /// is rate-limited to one broadcast per [`PROGRESS_INTERVAL`] per
    /// video, except the terminal 100% chunk which is always allowed
    /// through.
    pub async fn chunk(&self, video_id: &str, percent: f64) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Chunk {
                video_id: video_id.to_string(),
                percent,
                reply,
            })
            .await
            .map_err(|_| crate::Error::BusClosed("upload tracker stopped"))?;
        rx.await
            .map_err(|_| crate::Error::BusClosed("upload tracker stopped"))
    }

    /// Set a video's `stopping` flag: chunks keep flowing through the
    /// transport but are no longer reported.
    pub async fn mark_stopping(&self, video_id: &str) -> Result<()> {
        self.commands
            .send(Command::MarkStopping {
                video_id: video_id.to_string(),
            })
            .await
            .map_err(|_| crate::Error::BusClosed("upload tracker stopped"))
    }

    /// Abort every tracked upload request for a video and drop its session.
    ///
    /// Invoked when the publishing-stopped event is observed, which may
    /// originate from any worker via the bus.
    pub async fn stop(&self, video_id: &str) -> Result<()> {
        self.commands
            .send(Command::Stop {
                video_id: video_id.to_string(),
            })
            .await
            .map_err(|_| crate::Error::BusClosed("upload tracker stopped"))
    }
}

/// Observe delivered broadcasts and destroy upload sessions on the
/// publishing-stopped event.
///
/// The stop may originate from any worker; fan-out guarantees delivery to
/// the hub this listener subscribes to.
pub fn spawn_stop_listener(
    mut events: tokio::sync::broadcast::Receiver<crate::bus::BroadcastMessage>,
    tracker: UploadTracker,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(message)
                    if message.event == "publishing_stopping"
                        || message.event == "publishing_stopped" =>
                {
                    let Some(video_id) = message.data.get("videoId").and_then(|v| v.as_str())
                    else {
                        continue;
                    };
                    let result = if message.event == "publishing_stopping" {
                        tracker.mark_stopping(video_id).await
                    } else {
                        tracker.stop(video_id).await
                    };
                    if result.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Upload stop listener lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut sessions: HashMap<String, UploadSession> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Register { video_id, handle } => {
                let session = sessions.entry(video_id).or_insert_with(|| UploadSession {
                    handles: Vec::new(),
                    stopping: false,
                    last_progress: None,
                });
                session.handles.push(handle);
            }
            Command::Chunk {
                video_id,
                percent,
                reply,
            } => {
                let allowed = match sessions.get_mut(&video_id) {
                    Some(session) if !session.stopping => {
                        let now = Instant::now();
                        let due = session
                            .last_progress
                            .is_none_or(|last| now.duration_since(last) >= PROGRESS_INTERVAL);
                        // The terminal broadcast is guaranteed even when the
                        // last chunk lands inside the rate window.
                        if due || percent >= 100.0 {
                            session.last_progress = Some(now);
                            true
                        } else {
                            false
                        }
                    }
                    // Stopping, or never registered: nothing to report.
                    _ => false,
                };
                let _ = reply.send(allowed);
            }
            Command::MarkStopping { video_id } => {
                if let Some(session) = sessions.get_mut(&video_id) {
                    session.stopping = true;
                }
            }
            Command::Stop { video_id } => {
                if let Some(mut session) = sessions.remove(&video_id) {
                    // Safe to invoke on requests that already finished.
                    for handle in session.handles.drain(..) {
                        handle.cancel();
                    }
                    tracing::debug!(video_id = %video_id, "Upload session terminated");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_chunk_allowed_then_rate_limited() {
        let tracker = UploadTracker::spawn();
        let handle = CancellationToken::new();
        tracker.register("abc12345678", handle).await.unwrap();

        assert!(tracker.chunk("abc12345678", 10.0).await.unwrap());
        // Within the one-second window.
        assert!(!tracker.chunk("abc12345678", 20.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_broadcast_is_guaranteed() {
        let tracker = UploadTracker::spawn();
        tracker
            .register("abc12345678", CancellationToken::new())
            .await
            .unwrap();

        assert!(tracker.chunk("abc12345678", 99.0).await.unwrap());
        // Lands inside the rate window but is the terminal chunk.
        assert!(tracker.chunk("abc12345678", 100.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_aborts_all_tracked_requests() {
        let tracker = UploadTracker::spawn();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        tracker.register("abc12345678", first.clone()).await.unwrap();
        tracker
            .register("abc12345678", second.clone())
            .await
            .unwrap();

        tracker.stop("abc12345678").await.unwrap();

        first.cancelled().await;
        second.cancelled().await;
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn test_mark_stopping_silences_progress() {
        let tracker = UploadTracker::spawn();
        let handle = CancellationToken::new();
        tracker.register("abc12345678", handle.clone()).await.unwrap();

        assert!(tracker.chunk("abc12345678", 10.0).await.unwrap());
        tracker.mark_stopping("abc12345678").await.unwrap();

        // The upload keeps running but is no longer reported, not even the
        // terminal chunk.
        assert!(!tracker.chunk("abc12345678", 50.0).await.unwrap());
        assert!(!tracker.chunk("abc12345678", 100.0).await.unwrap());
        // Stopping alone does not abort the request.
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_chunk_after_stop_is_suppressed() {
        let tracker = UploadTracker::spawn();
        let handle = CancellationToken::new();
        tracker.register("abc12345678", handle.clone()).await.unwrap();

        assert!(tracker.chunk("abc12345678", 50.0).await.unwrap());
        tracker.stop("abc12345678").await.unwrap();

        // The chunk racing the stop observes it and stays silent.
        assert!(!tracker.chunk("abc12345678", 60.0).await.unwrap());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_is_safe_for_finished_requests() {
        let tracker = UploadTracker::spawn();
        let handle = CancellationToken::new();
        tracker.register("abc12345678", handle.clone()).await.unwrap();

        // The request finished before the stop arrived.
        handle.cancel();
        tracker.stop("abc12345678").await.unwrap();

        // Stopping an unknown video is a no-op too.
        tracker.stop("never-seen-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_untracked_video_emits_nothing() {
        let tracker = UploadTracker::spawn();
        assert!(!tracker.chunk("abc12345678", 10.0).await.unwrap());
    }
}
