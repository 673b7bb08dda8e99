//! History and block-alert reporting.
//!
//! Append-only audit records written to the caregiver's namespace so the
//! parent surface can show what was watched, listened to, and blocked.
//! Every write is best-effort and fire-and-forget: a network failure is
//! logged and swallowed, never surfaced to the playback path.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::pairing::{PairingSession, PairingState};
use crate::policy::BlockReason;
use crate::settings::{FilterSettings, MusicFilterSettings};
use crate::store::{paths, Document, RemoteStore};
use crate::types::now_unix;

// ============================================================================
// Records
// ============================================================================

/// One watched video or played track.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub content_id: String,
    pub title: String,
    /// Channel name for video, artist name for music.
    pub source: String,
    pub duration_seconds: u32,
    /// True when the item was blocked rather than played.
    pub blocked: bool,
    pub block_reason: Option<BlockReason>,
}

/// One blocked playback or search attempt, for the caregiver's alert feed.
#[derive(Debug, Clone)]
pub struct BlockedAttempt {
    pub content_id: String,
    pub title: String,
    /// Channel name for video, artist name for music.
    pub source: String,
    pub reason: BlockReason,
}

fn record_id() -> String {
    let mut bytes = [0u8; 8];
    // A degenerate id on RNG failure still produces a valid write.
    let _ = getrandom::getrandom(&mut bytes);
    format!("{}_{}", now_unix(), hex::encode(bytes))
}

fn history_doc(entry: &HistoryEntry, device_id: &str) -> Document {
    let mut doc = Document::new();
    doc.insert("contentId".into(), json!(entry.content_id));
    doc.insert("title".into(), json!(entry.title));
    doc.insert("source".into(), json!(entry.source));
    doc.insert("durationSeconds".into(), json!(entry.duration_seconds));
    doc.insert("blocked".into(), json!(entry.blocked));
    doc.insert(
        "blockReason".into(),
        json!(entry.block_reason.map(|r| r.to_string())),
    );
    doc.insert("deviceId".into(), json!(device_id));
    doc.insert("recordedAt".into(), json!(now_unix()));
    doc
}

fn alert_doc(attempt: &BlockedAttempt, device_id: &str) -> Document {
    let mut doc = Document::new();
    doc.insert("contentId".into(), json!(attempt.content_id));
    doc.insert("title".into(), json!(attempt.title));
    doc.insert("source".into(), json!(attempt.source));
    doc.insert("reason".into(), json!(attempt.reason.to_string()));
    doc.insert("deviceId".into(), json!(device_id));
    doc.insert("recordedAt".into(), json!(now_unix()));
    doc
}

// ============================================================================
// Reporter
// ============================================================================

/// Best-effort writer of history and alert records.
///
/// All methods are no-ops while the session is unpaired, and each record type
/// is gated by its own settings toggle. History records for blocked items are
/// written even when general history logging is off, so caregivers always
/// see block attempts.
pub struct EventReporter<S: RemoteStore> {
    store: Arc<S>,
    session: PairingSession<S>,
}

impl<S: RemoteStore> EventReporter<S> {
    pub fn new(store: Arc<S>, session: PairingSession<S>) -> Self {
        Self { store, session }
    }

    /// Record a video in the watch history.
    pub fn log_video_history(&self, entry: HistoryEntry, settings: &FilterSettings) {
        self.log_history(entry, settings.history_enabled, paths::watch_history);
    }

    /// Record a track in the listen history.
    pub fn log_music_history(&self, entry: HistoryEntry, settings: &MusicFilterSettings) {
        self.log_history(entry, settings.history_enabled, paths::music_history);
    }

    /// Raise a blocked-video alert.
    pub fn report_blocked_video(&self, attempt: BlockedAttempt, settings: &FilterSettings) {
        self.report_blocked(attempt, settings.alerts_enabled, paths::block_alert);
    }

    /// Raise a blocked-track alert.
    pub fn report_blocked_track(&self, attempt: BlockedAttempt, settings: &MusicFilterSettings) {
        self.report_blocked(attempt, settings.alerts_enabled, paths::music_alert);
    }

    fn log_history(
        &self,
        entry: HistoryEntry,
        history_enabled: bool,
        path_for: fn(&str, &str) -> String,
    ) {
        if !history_enabled && !entry.blocked {
            return;
        }
        let Some((caregiver, device_id)) = self.identity() else {
            return;
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let path = path_for(&caregiver, &record_id());
            let doc = history_doc(&entry, &device_id);
            match store.set(&path, doc).await {
                Ok(()) => debug!(path = %path, "history record written"),
                Err(e) => warn!(error = %e, "failed to write history record"),
            }
        });
    }

    fn report_blocked(
        &self,
        attempt: BlockedAttempt,
        alerts_enabled: bool,
        path_for: fn(&str, &str) -> String,
    ) {
        if !alerts_enabled {
            return;
        }
        let Some((caregiver, device_id)) = self.identity() else {
            return;
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let path = path_for(&caregiver, &record_id());
            let doc = alert_doc(&attempt, &device_id);
            match store.set(&path, doc).await {
                Ok(()) => debug!(path = %path, "block alert written"),
                Err(e) => warn!(error = %e, "failed to write block alert"),
            }
        });
    }

    fn identity(&self) -> Option<(String, String)> {
        match self.session.state() {
            PairingState::Paired {
                caregiver_ref,
                device_id,
                ..
            } => Some((caregiver_ref, device_id)),
            _ => None,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{new_session, pair_session, wait_until_async};
    use crate::store::InMemoryStore;

    fn entry(blocked: bool) -> HistoryEntry {
        HistoryEntry {
            content_id: "v1".into(),
            title: "Fun cartoon".into(),
            source: "Nice Channel".into(),
            duration_seconds: 90,
            blocked,
            block_reason: blocked.then_some(BlockReason::BlockedKeyword),
        }
    }

    fn attempt() -> BlockedAttempt {
        BlockedAttempt {
            content_id: "v1".into(),
            title: "Blocked video".into(),
            source: "Bad Channel".into(),
            reason: BlockReason::BlockedChannel,
        }
    }

    #[tokio::test]
    async fn test_noop_while_unpaired() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        let reporter = EventReporter::new(store.clone(), session);

        reporter.log_video_history(entry(false), &FilterSettings::default());
        reporter.report_blocked_video(attempt(), &FilterSettings::default());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(store.count_with_prefix("families/").await, 0);
    }

    #[tokio::test]
    async fn test_history_written_when_enabled() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        pair_session(&store, &session, None).await;
        let reporter = EventReporter::new(store.clone(), session);

        reporter.log_video_history(entry(false), &FilterSettings::default());
        wait_until_async(|| {
            let store = store.clone();
            async move { store.count_with_prefix("families/p1/watch_history/").await == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_history_gated_by_toggle_except_blocked_items() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        pair_session(&store, &session, None).await;
        let reporter = EventReporter::new(store.clone(), session);

        let settings = FilterSettings {
            history_enabled: false,
            ..Default::default()
        };
        reporter.log_video_history(entry(false), &settings);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.count_with_prefix("families/p1/watch_history/").await, 0);

        // A blocked item is recorded even with history off.
        reporter.log_video_history(entry(true), &settings);
        wait_until_async(|| {
            let store = store.clone();
            async move { store.count_with_prefix("families/p1/watch_history/").await == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_alerts_gated_by_toggle() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        pair_session(&store, &session, None).await;
        let reporter = EventReporter::new(store.clone(), session);

        let settings = MusicFilterSettings {
            alerts_enabled: false,
            ..Default::default()
        };
        reporter.report_blocked_track(attempt(), &settings);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.count_with_prefix("families/p1/music_alerts/").await, 0);

        reporter.report_blocked_track(attempt(), &MusicFilterSettings::default());
        wait_until_async(|| {
            let store = store.clone();
            async move { store.count_with_prefix("families/p1/music_alerts/").await == 1 }
        })
        .await;
    }
}
