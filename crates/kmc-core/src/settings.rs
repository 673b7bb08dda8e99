//! Caregiver settings snapshots.
//!
//! These are the decoded forms of the remote settings documents. Field names
//! follow the wire documents (camelCase); every field has a default so a
//! partial or absent document decodes without error.
//!
//! Missing-document policy: an absent settings document resolves to the
//! maximally permissive posture (`ALL` age rating, whitelist mode off, empty
//! lists, history and alerts on). The sync layer distinguishes "not yet
//! loaded" from "loaded with defaults" by publishing `Option` snapshots, so
//! the permissive default is only ever seen after an actual delivery.

use serde::{Deserialize, Serialize};

use crate::store::{from_document, Document};

// ============================================================================
// Age Ratings
// ============================================================================

/// Age band selected by the caregiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgeRating {
    /// No age restriction.
    #[default]
    All,
    FivePlus,
    EightPlus,
    TwelvePlus,
    SixteenPlus,
}

impl AgeRating {
    /// The 5-14 bands where music whitelist mode can activate.
    /// `SIXTEEN_PLUS` and `ALL` always bypass whitelist mode.
    pub fn is_restricted_band(self) -> bool {
        matches!(
            self,
            AgeRating::FivePlus | AgeRating::EightPlus | AgeRating::TwelvePlus
        )
    }
}

// ============================================================================
// Video Filter Settings
// ============================================================================

/// A channel reference in a block or allow list. Matched by exact id or by
/// lenient name containment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
}

/// Video policy snapshot. Default posture is blacklist: everything is allowed
/// unless a rule blocks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterSettings {
    pub blocked_keywords: Vec<String>,
    pub blocked_channels: Vec<ChannelRef>,
    pub blocked_video_ids: Vec<String>,
    pub blocked_categories: Vec<String>,

    /// When on, only channels in `allowed_channels` pass.
    pub whitelist_mode_enabled: bool,
    pub allowed_channels: Vec<ChannelRef>,

    pub block_live_streams: bool,
    pub block_comments: bool,
    /// Maximum duration in seconds, 0 = unlimited.
    pub max_duration_seconds: u32,

    // Independent age-based sub-layer.
    pub age_rating: AgeRating,
    pub age_based_filtering_enabled: bool,
    pub age_blocked_keywords: Vec<String>,
    pub age_max_duration_seconds: u32,

    pub history_enabled: bool,
    pub alerts_enabled: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            blocked_keywords: Vec::new(),
            blocked_channels: Vec::new(),
            blocked_video_ids: Vec::new(),
            blocked_categories: Vec::new(),
            whitelist_mode_enabled: false,
            allowed_channels: Vec::new(),
            block_live_streams: false,
            block_comments: false,
            max_duration_seconds: 0,
            age_rating: AgeRating::All,
            age_based_filtering_enabled: false,
            age_blocked_keywords: Vec::new(),
            age_max_duration_seconds: 0,
            history_enabled: true,
            alerts_enabled: true,
        }
    }
}

impl FilterSettings {
    /// Decode a remote document, falling back to field defaults.
    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        from_document(doc)
    }
}

// ============================================================================
// Music Filter Settings
// ============================================================================

/// Music policy snapshot.
///
/// A distinct entity from `FilterSettings` because its default posture
/// differs: for the 5-14 age bands with whitelist mode on, everything is
/// blocked unless allowed. The block lists are only meaningful when whitelist
/// mode is off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MusicFilterSettings {
    pub age_rating: AgeRating,

    /// Whitelist mode; only activates for the restricted age bands.
    pub whitelist_mode_enabled: bool,
    pub allowed_artists: Vec<String>,
    pub allowed_keywords: Vec<String>,
    pub allowed_albums: Vec<String>,
    /// Activates the fixed curated kids-artist allow set.
    pub default_kids_artists_enabled: bool,

    pub blocked_artists: Vec<String>,
    pub blocked_keywords: Vec<String>,
    pub blocked_genres: Vec<String>,

    pub block_explicit: bool,
    /// Maximum duration in seconds, 0 = unlimited.
    pub max_duration_seconds: u32,

    pub age_based_filtering_enabled: bool,
    pub age_blocked_keywords: Vec<String>,
    pub age_max_duration_seconds: u32,

    pub history_enabled: bool,
    pub alerts_enabled: bool,
}

impl Default for MusicFilterSettings {
    fn default() -> Self {
        Self {
            age_rating: AgeRating::All,
            whitelist_mode_enabled: false,
            allowed_artists: Vec::new(),
            allowed_keywords: Vec::new(),
            allowed_albums: Vec::new(),
            default_kids_artists_enabled: false,
            blocked_artists: Vec::new(),
            blocked_keywords: Vec::new(),
            blocked_genres: Vec::new(),
            // Explicit tracks stay blocked until a caregiver opts out.
            block_explicit: true,
            max_duration_seconds: 0,
            age_based_filtering_enabled: false,
            age_blocked_keywords: Vec::new(),
            age_max_duration_seconds: 0,
            history_enabled: true,
            alerts_enabled: true,
        }
    }
}

impl MusicFilterSettings {
    /// Decode a remote document, falling back to field defaults.
    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        from_document(doc)
    }
}

// ============================================================================
// Coarse Parental Controls
// ============================================================================

/// Coarse, cross-cutting settings: age rating, screen time, bedtime window
/// and the caregiver PIN hash. Read on demand, not kept under subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParentalControls {
    pub age_rating: AgeRating,
    /// Daily screen time limit in minutes, 0 = unlimited.
    pub screen_time_limit_minutes: u32,
    /// Bedtime window start, "HH:MM" local time.
    pub bedtime_start: Option<String>,
    /// Bedtime window end, "HH:MM" local time.
    pub bedtime_end: Option<String>,
    pub pin_hash: Option<String>,
}

impl Default for ParentalControls {
    fn default() -> Self {
        Self {
            age_rating: AgeRating::All,
            screen_time_limit_minutes: 0,
            bedtime_start: None,
            bedtime_end: None,
            pin_hash: None,
        }
    }
}

impl ParentalControls {
    /// Decode a remote document, falling back to field defaults.
    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        from_document(doc)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
