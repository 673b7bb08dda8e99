//! Shared candidate types and small helpers.

/// A video under evaluation. Missing optional metadata is represented as an
/// empty string, never as an error.
#[derive(Debug, Clone, Default)]
pub struct VideoCandidate {
    pub video_id: String,
    pub title: String,
    pub channel_id: String,
    pub channel_name: String,
    pub description: String,
    pub category: String,
    pub duration_seconds: u32,
    pub is_live: bool,
}

/// A music track under evaluation. Missing optional metadata is represented
/// as an empty string, never as an error.
#[derive(Debug, Clone, Default)]
pub struct TrackCandidate {
    pub track_id: String,
    pub title: String,
    pub artist_id: String,
    pub artist_name: String,
    pub album: String,
    pub genre: String,
    pub duration_seconds: u32,
    pub is_explicit: bool,
}

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
