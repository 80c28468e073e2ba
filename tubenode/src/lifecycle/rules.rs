//! Transition legality rules.
//!
//! Pure functions over flag snapshots: no store access, no channels.
//! Preconditions are checked before any write job is issued, so a
//! transition that would violate the phase invariant never reaches the
//! store.

use crate::database::models::VideoFlags;

/// REST-triggered lifecycle transitions on an existing video row.
///
/// Row-creating operations (start import, start live stream) have no flag
/// precondition and are handled by the service directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CompleteImport,
    StopImport,
    StartPublish,
    CompletePublish,
    StopPublish,
    StopLiveStream,
    MarkError,
    Finalize,
    Delete,
}

impl Transition {
    /// Check this transition against a video's current flags.
    ///
    /// Returns the rejection reason when the transition is illegal.
    pub fn check(&self, flags: &VideoFlags) -> Result<(), String> {
        match self {
            Transition::CompleteImport | Transition::StopImport => {
                if !flags.importing {
                    return Err("video is not importing".to_string());
                }
            }
            Transition::StartPublish => {
                if flags.phase_active() {
                    return Err("another processing phase is active".to_string());
                }
                if !flags.imported && !flags.live {
                    return Err("video is neither imported nor live".to_string());
                }
            }
            Transition::CompletePublish | Transition::StopPublish => {
                if !flags.publishing {
                    return Err("video is not publishing".to_string());
                }
            }
            Transition::StopLiveStream => {
                if !flags.streaming {
                    return Err("video is not streaming".to_string());
                }
            }
            Transition::MarkError => {}
            Transition::Finalize => {
                if flags.phase_active() {
                    return Err("cannot finalize while a processing phase is active".to_string());
                }
            }
            Transition::Delete => {
                if flags.phase_active() {
                    return Err("cannot delete while a processing phase is active".to_string());
                }
                if flags.indexed {
                    return Err("cannot delete an indexed video".to_string());
                }
            }
        }
        Ok(())
    }

    /// The single mutation statement implementing this transition.
    pub fn statement(&self) -> &'static str {
        match self {
            Transition::CompleteImport => {
                "UPDATE videos SET importing = 0, imported = 1 WHERE video_id = ?"
            }
            Transition::StopImport => "UPDATE videos SET importing = 0 WHERE video_id = ?",
            Transition::StartPublish => "UPDATE videos SET publishing = 1 WHERE video_id = ?",
            Transition::CompletePublish => {
                "UPDATE videos SET publishing = 0, published = 1 WHERE video_id = ?"
            }
            Transition::StopPublish => "UPDATE videos SET publishing = 0 WHERE video_id = ?",
            Transition::StopLiveStream => {
                "UPDATE videos SET streaming = 0, streamed = 1, \
                 index_outdated = CASE WHEN indexed = 1 THEN 1 ELSE index_outdated END \
                 WHERE video_id = ?"
            }
            Transition::MarkError => "UPDATE videos SET error = 1 WHERE video_id = ?",
            Transition::Finalize => "UPDATE videos SET finalized = 1 WHERE video_id = ?",
            Transition::Delete => "DELETE FROM videos WHERE video_id = ?",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn flags(importing: bool, publishing: bool, streaming: bool) -> VideoFlags {
        VideoFlags {
            importing,
            publishing,
            streaming,
            ..VideoFlags::default()
        }
    }

    #[rstest]
    #[case(Transition::CompleteImport)]
    #[case(Transition::StopImport)]
    fn import_transitions_require_importing(#[case] transition: Transition) {
        assert!(transition.check(&flags(true, false, false)).is_ok());
        assert!(transition.check(&flags(false, false, false)).is_err());
    }

    #[rstest]
    #[case(Transition::CompletePublish)]
    #[case(Transition::StopPublish)]
    fn publish_transitions_require_publishing(#[case] transition: Transition) {
        assert!(transition.check(&flags(false, true, false)).is_ok());
        assert!(transition.check(&flags(false, false, false)).is_err());
    }

    #[test]
    fn start_publish_requires_imported_or_live() {
        let mut f = VideoFlags::default();
        assert!(Transition::StartPublish.check(&f).is_err());

        f.imported = true;
        assert!(Transition::StartPublish.check(&f).is_ok());

        let live = VideoFlags {
            live: true,
            ..VideoFlags::default()
        };
        assert!(Transition::StartPublish.check(&live).is_ok());
    }

    #[rstest]
    #[case(flags(true, false, false))]
    #[case(flags(false, true, false))]
    #[case(flags(false, false, true))]
    fn start_publish_rejected_while_phase_active(#[case] mut active: VideoFlags) {
        // Even an otherwise-eligible video must not enter a second phase.
        active.imported = true;
        assert!(Transition::StartPublish.check(&active).is_err());
    }

    #[test]
    fn stop_live_stream_requires_streaming() {
        assert!(Transition::StopLiveStream.check(&flags(false, false, true)).is_ok());
        assert!(
            Transition::StopLiveStream
                .check(&flags(false, false, false))
                .is_err()
        );
    }

    #[rstest]
    #[case(flags(true, false, false))]
    #[case(flags(false, true, false))]
    #[case(flags(false, false, true))]
    fn finalize_rejected_while_phase_active(#[case] active: VideoFlags) {
        assert!(Transition::Finalize.check(&active).is_err());
        assert!(Transition::Finalize.check(&VideoFlags::default()).is_ok());
    }

    #[test]
    fn mark_error_is_always_legal() {
        assert!(Transition::MarkError.check(&flags(true, false, false)).is_ok());
        assert!(Transition::MarkError.check(&VideoFlags::default()).is_ok());
    }

    #[test]
    fn delete_requires_idle_and_unindexed() {
        assert!(Transition::Delete.check(&VideoFlags::default()).is_ok());
        assert!(Transition::Delete.check(&flags(false, true, false)).is_err());

        let indexed = VideoFlags {
            indexed: true,
            ..VideoFlags::default()
        };
        assert!(Transition::Delete.check(&indexed).is_err());
    }
}
