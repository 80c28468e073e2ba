//! Read-side repositories.
//!
//! Workers query the store directly through these repositories on the read
//! pool; WAL gives them snapshot consistency against the coordinator's
//! writes. All mutations go through the coordinator instead.

pub mod video;

pub use video::{SqlxVideoRepository, VideoRepository};
