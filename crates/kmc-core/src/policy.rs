//! Layered content decision engine.
//!
//! Pure evaluation of one candidate (video, track, or search query) against a
//! caregiver settings snapshot plus the operator rule snapshot. Evaluations
//! are synchronous, side-effect free and safe to call concurrently; layers
//! are checked in a fixed order and the first match wins.
//!
//! All string comparisons are case-insensitive and whitespace-trimmed, and
//! name matching is bidirectional substring containment: either side
//! containing the other counts as a match. This leniency is deliberate and
//! load-bearing for caregiver-typed lists.

use crate::global_rules::GlobalRuleSettings;
use crate::settings::{ChannelRef, FilterSettings, MusicFilterSettings};
use crate::types::{TrackCandidate, VideoCandidate};

// ============================================================================
// Curated Sets
// ============================================================================

/// Operator-curated artists considered safe for young children. Used by the
/// music whitelist mode when `defaultKidsArtistsEnabled` is on.
pub const DEFAULT_KIDS_ARTISTS: &[&str] = &[
    "Super Simple Songs",
    "Cocomelon",
    "Pinkfong",
    "Little Baby Bum",
    "Kidz Bop",
    "The Wiggles",
    "Raffi",
    "Laurie Berkner",
    "Sesame Street",
    "Blippi",
    "Dave and Ava",
    "Bob the Builder",
];

/// Search terms considered safe in whitelist mode even without an explicit
/// allow-list entry.
pub const KID_SAFE_SEARCH_TERMS: &[&str] = &[
    "nursery rhymes",
    "kids songs",
    "lullaby",
    "abc song",
    "counting song",
    "sing along",
    "story time",
    "baby shark",
    "wheels on the bus",
    "twinkle twinkle",
];

// ============================================================================
// Block Results
// ============================================================================

/// Why a candidate was blocked. Closed, user-presentable enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    BlockedKeyword,
    BlockedChannel,
    BlockedVideo,
    BlockedArtist,
    BlockedCategory,
    NotWhitelisted,
    LiveStream,
    TooLong,
    AgeRestricted,
    ExplicitContent,
    SearchNotAllowed,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::BlockedKeyword => write!(f, "blocked_keyword"),
            BlockReason::BlockedChannel => write!(f, "blocked_channel"),
            BlockReason::BlockedVideo => write!(f, "blocked_video"),
            BlockReason::BlockedArtist => write!(f, "blocked_artist"),
            BlockReason::BlockedCategory => write!(f, "blocked_category"),
            BlockReason::NotWhitelisted => write!(f, "not_whitelisted"),
            BlockReason::LiveStream => write!(f, "live_stream"),
            BlockReason::TooLong => write!(f, "too_long"),
            BlockReason::AgeRestricted => write!(f, "age_restricted"),
            BlockReason::ExplicitContent => write!(f, "explicit_content"),
            BlockReason::SearchNotAllowed => write!(f, "search_not_allowed"),
        }
    }
}

/// Outcome of a single evaluation. Immutable, no side effects.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockResult {
    pub is_blocked: bool,
    pub reason: Option<BlockReason>,
    pub message: Option<String>,
}

impl BlockResult {
    pub fn allowed() -> Self {
        Self {
            is_blocked: false,
            reason: None,
            message: None,
        }
    }

    pub fn blocked(reason: BlockReason, message: impl Into<String>) -> Self {
        Self {
            is_blocked: true,
            reason: Some(reason),
            message: Some(message.into()),
        }
    }
}

// ============================================================================
// Matching Helpers
// ============================================================================

fn norm(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Bidirectional substring containment, case-insensitive, whitespace-trimmed.
/// Empty strings never match anything.
pub fn names_match(a: &str, b: &str) -> bool {
    let a = norm(a);
    let b = norm(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}

/// True if `name` matches any list entry under `names_match`.
pub fn any_name_match(name: &str, list: &[String]) -> bool {
    list.iter().any(|entry| names_match(name, entry))
}

/// First keyword contained in `text`, if any. Keywords are matched one-way:
/// the keyword must appear inside the text.
pub fn keyword_hit<'a>(text: &str, keywords: &'a [String]) -> Option<&'a str> {
    let text = norm(text);
    keywords.iter().map(String::as_str).find(|k| {
        let k = norm(k);
        !k.is_empty() && text.contains(&k)
    })
}

fn channel_listed(id: &str, name: &str, list: &[ChannelRef]) -> bool {
    let id = norm(id);
    list.iter().any(|entry| {
        (!id.is_empty() && norm(&entry.id) == id) || names_match(name, &entry.name)
    })
}

fn in_category_set(category: &str, set: &[String]) -> bool {
    let category = norm(category);
    !category.is_empty() && set.iter().any(|entry| norm(entry) == category)
}

// ============================================================================
// Video Evaluation
// ============================================================================

/// Evaluate one video candidate. Layers are checked in order; the first
/// match short-circuits.
pub fn evaluate_video(
    candidate: &VideoCandidate,
    settings: &FilterSettings,
    rules: &GlobalRuleSettings,
) -> BlockResult {
    let text = format!(
        "{} {} {}",
        candidate.title, candidate.channel_name, candidate.description
    );

    // 1. Operator rules outrank everything the caregiver configured.
    if keyword_hit(&text, &rules.blocked_keywords).is_some() {
        return BlockResult::blocked(BlockReason::BlockedKeyword, "This video is not available");
    }
    if rules.is_channel_blocked(&candidate.channel_id, &candidate.channel_name) {
        return BlockResult::blocked(BlockReason::BlockedChannel, "This channel is not available");
    }

    // 2. Explicit video blocklist.
    let video_id = norm(&candidate.video_id);
    if !video_id.is_empty()
        && settings
            .blocked_video_ids
            .iter()
            .any(|id| norm(id) == video_id)
    {
        return BlockResult::blocked(BlockReason::BlockedVideo, "This video has been blocked");
    }

    // 3. Explicit channel blocklist.
    if channel_listed(
        &candidate.channel_id,
        &candidate.channel_name,
        &settings.blocked_channels,
    ) {
        return BlockResult::blocked(BlockReason::BlockedChannel, "This channel has been blocked");
    }

    // 4. Whitelist-only mode.
    if settings.whitelist_mode_enabled
        && !channel_listed(
            &candidate.channel_id,
            &candidate.channel_name,
            &settings.allowed_channels,
        )
    {
        return BlockResult::blocked(
            BlockReason::NotWhitelisted,
            "Only approved channels can be watched",
        );
    }

    // 5. Live streams.
    if candidate.is_live && settings.block_live_streams {
        return BlockResult::blocked(BlockReason::LiveStream, "Live videos are not allowed");
    }

    // 6. Duration cap, strict greater-than.
    if settings.max_duration_seconds > 0
        && candidate.duration_seconds > settings.max_duration_seconds
    {
        return BlockResult::blocked(BlockReason::TooLong, "This video is too long");
    }

    // 7. Caregiver keyword blocklist.
    if let Some(k) = keyword_hit(&text, &settings.blocked_keywords) {
        return BlockResult::blocked(
            BlockReason::BlockedKeyword,
            format!("Blocked by keyword \"{k}\""),
        );
    }

    // 8. Category blocklist.
    if in_category_set(&candidate.category, &settings.blocked_categories) {
        return BlockResult::blocked(
            BlockReason::BlockedCategory,
            "This kind of video is not allowed",
        );
    }

    // 9. Age-based sub-layer.
    if settings.age_based_filtering_enabled {
        if settings.age_max_duration_seconds > 0
            && candidate.duration_seconds > settings.age_max_duration_seconds
        {
            return BlockResult::blocked(
                BlockReason::AgeRestricted,
                "This video is too long for this age setting",
            );
        }
        if keyword_hit(&text, &settings.age_blocked_keywords).is_some() {
            return BlockResult::blocked(
                BlockReason::AgeRestricted,
                "This video is not right for this age setting",
            );
        }
    }

    BlockResult::allowed()
}

// ============================================================================
// Music Evaluation
// ============================================================================

/// True when music whitelist mode is in effect: the caregiver turned it on
/// and the age rating is one of the restricted 5-14 bands.
pub fn whitelist_mode_active(settings: &MusicFilterSettings) -> bool {
    settings.whitelist_mode_enabled && settings.age_rating.is_restricted_band()
}

/// The narrow whitelist evaluator. When whitelist mode is active everything
/// is blocked by default; a track passes only by matching, in order, the
/// curated kids-artist set (if enabled), the allowed artists, the allowed
/// keywords, or the allowed albums.
pub fn evaluate_track_whitelist(
    candidate: &TrackCandidate,
    settings: &MusicFilterSettings,
) -> BlockResult {
    if !whitelist_mode_active(settings) {
        return BlockResult::allowed();
    }

    if settings.default_kids_artists_enabled
        && DEFAULT_KIDS_ARTISTS
            .iter()
            .any(|artist| names_match(&candidate.artist_name, artist))
    {
        return BlockResult::allowed();
    }
    if any_name_match(&candidate.artist_name, &settings.allowed_artists) {
        return BlockResult::allowed();
    }
    let text = format!(
        "{} {} {}",
        candidate.title, candidate.artist_name, candidate.album
    );
    if keyword_hit(&text, &settings.allowed_keywords).is_some() {
        return BlockResult::allowed();
    }
    if any_name_match(&candidate.album, &settings.allowed_albums) {
        return BlockResult::allowed();
    }

    BlockResult::blocked(
        BlockReason::NotWhitelisted,
        "Only approved music can be played",
    )
}

/// Evaluate one track candidate. Layers are checked in order; the first
/// match short-circuits.
pub fn evaluate_track(
    candidate: &TrackCandidate,
    settings: &MusicFilterSettings,
    rules: &GlobalRuleSettings,
) -> BlockResult {
    let text = format!(
        "{} {} {}",
        candidate.title, candidate.artist_name, candidate.album
    );

    // 1. Operator rules.
    if keyword_hit(&text, &rules.blocked_keywords).is_some() {
        return BlockResult::blocked(BlockReason::BlockedKeyword, "This track is not available");
    }
    if rules.is_artist_blocked(&candidate.artist_id, &candidate.artist_name) {
        return BlockResult::blocked(BlockReason::BlockedArtist, "This artist is not available");
    }

    // 2. Explicit content, ahead of any allow-list.
    if candidate.is_explicit && settings.block_explicit {
        return BlockResult::blocked(
            BlockReason::ExplicitContent,
            "Explicit music is not allowed",
        );
    }

    // 3. Explicit artist blocklist.
    if any_name_match(&candidate.artist_name, &settings.blocked_artists) {
        return BlockResult::blocked(BlockReason::BlockedArtist, "This artist has been blocked");
    }

    // 4. Whitelist mode.
    let whitelist = evaluate_track_whitelist(candidate, settings);
    if whitelist.is_blocked {
        return whitelist;
    }

    // 5. Duration cap, strict greater-than.
    if settings.max_duration_seconds > 0
        && candidate.duration_seconds > settings.max_duration_seconds
    {
        return BlockResult::blocked(BlockReason::TooLong, "This track is too long");
    }

    // 6. Caregiver keyword blocklist.
    if let Some(k) = keyword_hit(&text, &settings.blocked_keywords) {
        return BlockResult::blocked(
            BlockReason::BlockedKeyword,
            format!("Blocked by keyword \"{k}\""),
        );
    }

    // 7. Genre blocklist.
    if in_category_set(&candidate.genre, &settings.blocked_genres) {
        return BlockResult::blocked(
            BlockReason::BlockedCategory,
            "This kind of music is not allowed",
        );
    }

    // 8. Age-based sub-layer.
    if settings.age_based_filtering_enabled {
        if settings.age_max_duration_seconds > 0
            && candidate.duration_seconds > settings.age_max_duration_seconds
        {
            return BlockResult::blocked(
                BlockReason::AgeRestricted,
                "This track is too long for this age setting",
            );
        }
        if keyword_hit(&text, &settings.age_blocked_keywords).is_some() {
            return BlockResult::blocked(
                BlockReason::AgeRestricted,
                "This track is not right for this age setting",
            );
        }
    }

    BlockResult::allowed()
}

// ============================================================================
// Search Evaluation
// ============================================================================

/// Lightweight check applied to a video search query before any results are
/// fetched.
pub fn evaluate_video_search(
    query: &str,
    settings: &FilterSettings,
    rules: &GlobalRuleSettings,
) -> BlockResult {
    if keyword_hit(query, &rules.blocked_keywords).is_some()
        || keyword_hit(query, &settings.blocked_keywords).is_some()
    {
        return BlockResult::blocked(BlockReason::BlockedKeyword, "That search is not allowed");
    }
    if settings.age_based_filtering_enabled
        && keyword_hit(query, &settings.age_blocked_keywords).is_some()
    {
        return BlockResult::blocked(BlockReason::AgeRestricted, "That search is not allowed");
    }
    BlockResult::allowed()
}

/// Lightweight check applied to a music search query. In whitelist mode the
/// query must match an allowed artist or keyword, a curated kid-safe term,
/// or (when enabled) a default kids artist.
pub fn evaluate_music_search(
    query: &str,
    settings: &MusicFilterSettings,
    rules: &GlobalRuleSettings,
) -> BlockResult {
    if keyword_hit(query, &rules.blocked_keywords).is_some() {
        return BlockResult::blocked(BlockReason::BlockedKeyword, "That search is not allowed");
    }

    if whitelist_mode_active(settings) {
        let allowed = any_name_match(query, &settings.allowed_artists)
            || keyword_hit(query, &settings.allowed_keywords).is_some()
            || KID_SAFE_SEARCH_TERMS.iter().any(|t| names_match(query, t))
            || (settings.default_kids_artists_enabled
                && DEFAULT_KIDS_ARTISTS.iter().any(|a| names_match(query, a)));
        if allowed {
            return BlockResult::allowed();
        }
        return BlockResult::blocked(
            BlockReason::SearchNotAllowed,
            "Only approved searches are allowed",
        );
    }

    if keyword_hit(query, &settings.blocked_keywords).is_some() {
        return BlockResult::blocked(BlockReason::BlockedKeyword, "That search is not allowed");
    }
    BlockResult::allowed()
}

// ============================================================================
// Unit Tests
// ============================================================================
