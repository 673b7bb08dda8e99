//! Settings synchronization.
//!
//! Given a paired session, the coordinator keeps exactly one live
//! subscription to the device registration and one per settings document
//! (video and music), resolving the per-child path with a legacy fallback.
//! It republishes decoded snapshots on watch channels, detects remote
//! revocation and child reassignment, and raises a manual-reset "unlinked"
//! flag for the consuming layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::pairing::{PairingSession, PairingState};
use crate::settings::{FilterSettings, MusicFilterSettings, ParentalControls};
use crate::store::{from_document, paths, RemoteStore, StoreError};

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by on-demand sync reads.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("device is not paired")]
    NotPaired,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("decode error: {0}")]
    Decode(String),
}

// ============================================================================
// Path Resolution
// ============================================================================

/// Resolve the settings path for one document.
///
/// A per-child path is probed with a single non-subscribing read; the legacy
/// caregiver-wide path is used when the per-child document is absent, and
/// also when the probe itself fails. Availability wins over strictness here:
/// a network error must not leave the device without any settings stream.
pub(crate) async fn resolve_settings_path<S: RemoteStore>(
    store: &S,
    per_child: Option<String>,
    legacy: String,
) -> String {
    let Some(candidate) = per_child else {
        return legacy;
    };
    match store.get(&candidate).await {
        Ok(Some(_)) => candidate,
        Ok(None) => legacy,
        Err(e) => {
            warn!(error = %e, path = %candidate, "settings probe failed, using family-wide path");
            legacy
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Owns the live subscriptions for a paired session and publishes settings
/// snapshots.
///
/// Snapshots are `None` until the first delivery for the current pairing;
/// consumers must treat `None` as "do not filter yet" rather than
/// substituting defaults of their own.
pub struct SettingsSyncCoordinator<S: RemoteStore> {
    session: PairingSession<S>,
    store: Arc<S>,
    video_tx: Arc<watch::Sender<Option<FilterSettings>>>,
    music_tx: Arc<watch::Sender<Option<MusicFilterSettings>>>,
    unlinked: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    supervisor: JoinHandle<()>,
}

impl<S: RemoteStore> SettingsSyncCoordinator<S> {
    /// Start the coordinator for a session. Subscriptions come and go with
    /// the session's pairing state; the coordinator itself runs until
    /// `shutdown`.
    pub fn spawn(session: PairingSession<S>, store: Arc<S>) -> Self {
        let video_tx = Arc::new(watch::channel(None).0);
        let music_tx = Arc::new(watch::channel(None).0);
        let unlinked = Arc::new(AtomicBool::new(false));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let supervisor = tokio::spawn(supervise(
            session.clone(),
            Arc::clone(&store),
            Arc::clone(&video_tx),
            Arc::clone(&music_tx),
            Arc::clone(&unlinked),
            Arc::clone(&tasks),
        ));

        Self {
            session,
            store,
            video_tx,
            music_tx,
            unlinked,
            tasks,
            supervisor,
        }
    }

    /// Latest video settings snapshot, `None` until loaded.
    pub fn video_settings(&self) -> Option<FilterSettings> {
        self.video_tx.borrow().clone()
    }

    /// Latest music settings snapshot, `None` until loaded.
    pub fn music_settings(&self) -> Option<MusicFilterSettings> {
        self.music_tx.borrow().clone()
    }

    /// Watch the video settings snapshot.
    pub fn subscribe_video_settings(&self) -> watch::Receiver<Option<FilterSettings>> {
        self.video_tx.subscribe()
    }

    /// Watch the music settings snapshot.
    pub fn subscribe_music_settings(&self) -> watch::Receiver<Option<MusicFilterSettings>> {
        self.music_tx.subscribe()
    }

    /// True once the video settings snapshot has loaded.
    pub fn has_loaded_video_settings(&self) -> bool {
        self.video_tx.borrow().is_some()
    }

    /// True once the music settings snapshot has loaded.
    pub fn has_loaded_music_settings(&self) -> bool {
        self.music_tx.borrow().is_some()
    }

    /// True once both settings snapshots have loaded.
    pub fn has_loaded_settings(&self) -> bool {
        self.has_loaded_video_settings() && self.has_loaded_music_settings()
    }

    /// One-shot flag set when the caregiver unlinked this device or removed
    /// its child assignment. Stays set until explicitly cleared.
    pub fn unlinked_by_caregiver(&self) -> bool {
        self.unlinked.load(Ordering::SeqCst)
    }

    /// Clear the unlinked flag after the consuming layer has shown it.
    pub fn clear_unlinked_flag(&self) {
        self.unlinked.store(false, Ordering::SeqCst);
    }

    /// One-shot read of the coarse parental controls, resolved with the same
    /// per-child fallback as the settings subscriptions. An absent document
    /// yields the defaults.
    pub async fn fetch_parental_controls(&self) -> Result<ParentalControls, SyncError> {
        let PairingState::Paired {
            caregiver_ref,
            child_profile_id,
            ..
        } = self.session.state()
        else {
            return Err(SyncError::NotPaired);
        };
        let per_child = child_profile_id
            .as_deref()
            .map(|child| paths::child_parental_controls(&caregiver_ref, child));
        let path = resolve_settings_path(
            self.store.as_ref(),
            per_child,
            paths::parental_controls(&caregiver_ref),
        )
        .await;
        match self.store.get(&path).await? {
            Some(doc) => {
                ParentalControls::from_document(doc).map_err(|e| SyncError::Decode(e.to_string()))
            }
            None => Ok(ParentalControls::default()),
        }
    }

    /// Stop the coordinator and tear down all subscriptions.
    pub async fn shutdown(&self) {
        self.supervisor.abort();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// React to pairing state changes. Every change tears down the previous
/// subscription set before building the next one, so two listeners never
/// race to publish snapshots.
async fn supervise<S: RemoteStore>(
    session: PairingSession<S>,
    store: Arc<S>,
    video_tx: Arc<watch::Sender<Option<FilterSettings>>>,
    music_tx: Arc<watch::Sender<Option<MusicFilterSettings>>>,
    unlinked: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let mut state_rx = session.subscribe_state();
    loop {
        let state = state_rx.borrow_and_update().clone();

        {
            let mut tasks = tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        match state {
            PairingState::Paired {
                caregiver_ref,
                device_id,
                child_profile_id,
                ..
            } => {
                info!(caregiver = %caregiver_ref, child = ?child_profile_id, "binding settings subscriptions");
                let registration = tokio::spawn(watch_registration(
                    Arc::clone(&store),
                    session.clone(),
                    caregiver_ref.clone(),
                    device_id,
                    child_profile_id.clone(),
                    Arc::clone(&unlinked),
                ));
                let video = tokio::spawn(bind_settings(
                    Arc::clone(&store),
                    child_profile_id
                        .as_deref()
                        .map(|child| paths::child_content_filter(&caregiver_ref, child)),
                    paths::content_filter(&caregiver_ref),
                    Arc::clone(&video_tx),
                    "video",
                ));
                let music = tokio::spawn(bind_settings(
                    Arc::clone(&store),
                    child_profile_id
                        .as_deref()
                        .map(|child| paths::child_music_filter(&caregiver_ref, child)),
                    paths::music_filter(&caregiver_ref),
                    Arc::clone(&music_tx),
                    "music",
                ));
                tasks.lock().await.extend([registration, video, music]);
            }
            PairingState::Unpaired => {
                video_tx.send_replace(None);
                music_tx.send_replace(None);
            }
            // Transient while a redemption is in flight; nothing to bind.
            PairingState::Pairing => {}
        }

        if state_rx.changed().await.is_err() {
            break;
        }
    }
}

/// Keep one settings document decoded and published.
async fn bind_settings<S, T>(
    store: Arc<S>,
    per_child: Option<String>,
    legacy: String,
    tx: Arc<watch::Sender<Option<T>>>,
    domain: &'static str,
) where
    S: RemoteStore,
    T: DeserializeOwned + Default + Clone + Send + Sync + 'static,
{
    let path = resolve_settings_path(store.as_ref(), per_child, legacy).await;
    let mut sub = match store.subscribe(&path).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(domain, error = %e, "failed to open settings subscription");
            return;
        }
    };
    while let Some(event) = sub.next().await {
        match event {
            Ok(Some(doc)) => match from_document::<T>(doc) {
                Ok(snapshot) => {
                    tx.send_replace(Some(snapshot));
                }
                Err(e) => {
                    // Last-known-good: a malformed document never replaces a
                    // working snapshot.
                    warn!(domain, error = %e, "failed to decode settings document");
                }
            },
            Ok(None) => {
                tx.send_replace(Some(T::default()));
            }
            Err(e) => {
                warn!(domain, error = %e, "settings stream error");
            }
        }
    }
}

/// Watch the device registration for revocation and reassignment.
async fn watch_registration<S: RemoteStore>(
    store: Arc<S>,
    session: PairingSession<S>,
    caregiver_ref: String,
    device_id: String,
    mut known_child: Option<String>,
    unlinked: Arc<AtomicBool>,
) {
    let path = paths::device_registration(&caregiver_ref, &device_id);
    let mut sub = match store.subscribe(&path).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(error = %e, "failed to watch device registration");
            return;
        }
    };
    while let Some(event) = sub.next().await {
        match event {
            Ok(None) => {
                // The caregiver removed this device. The teardown must not
                // run inside this delivery loop, so hand it to a fresh task.
                unlinked.store(true, Ordering::SeqCst);
                let session = session.clone();
                tokio::spawn(async move {
                    session.handle_remote_revocation().await;
                });
                return;
            }
            Ok(Some(doc)) => {
                let child = doc
                    .get("childId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if child != known_child {
                    known_child = child.clone();
                    if child.is_none() {
                        unlinked.store(true, Ordering::SeqCst);
                    }
                    // The state republish rebuilds every subscription.
                    let session = session.clone();
                    tokio::spawn(async move {
                        session.apply_reassignment(child).await;
                    });
                }
            }
            Err(e) => {
                warn!(error = %e, "registration stream error");
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{new_session, pair_session, seed_document, wait_until};
    use crate::settings::AgeRating;
    use crate::store::{Document, InMemoryStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_path_resolution_prefers_existing_per_child_doc() {
        let store = InMemoryStore::new();
        let per_child = paths::child_content_filter("p1", "c1");
        store.set(&per_child, Document::new()).await.unwrap();

        let resolved = resolve_settings_path(
            &store,
            Some(per_child.clone()),
            paths::content_filter("p1"),
        )
        .await;
        assert_eq!(resolved, per_child);
    }

    #[tokio::test]
    async fn test_path_resolution_falls_back_when_absent_or_failing() {
        let store = InMemoryStore::new();
        let per_child = paths::child_content_filter("p1", "c1");
        let legacy = paths::content_filter("p1");

        let resolved =
            resolve_settings_path(&store, Some(per_child.clone()), legacy.clone()).await;
        assert_eq!(resolved, legacy);

        store.inject_read_failure(&per_child).await;
        let resolved =
            resolve_settings_path(&store, Some(per_child.clone()), legacy.clone()).await;
        assert_eq!(resolved, legacy);

        // No child assignment: straight to the legacy path.
        let resolved = resolve_settings_path(&store, None, legacy.clone()).await;
        assert_eq!(resolved, legacy);
    }

    #[tokio::test]
    async fn test_absent_settings_publish_defaults_and_mark_loaded() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        let coordinator = SettingsSyncCoordinator::spawn(session.clone(), store.clone());
        assert!(!coordinator.has_loaded_settings());

        pair_session(&store, &session, None).await;
        wait_until(|| coordinator.has_loaded_settings()).await;

        assert_eq!(coordinator.video_settings(), Some(FilterSettings::default()));
        assert_eq!(
            coordinator.music_settings(),
            Some(MusicFilterSettings::default())
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_settings_snapshot_follows_remote_changes() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        let coordinator = SettingsSyncCoordinator::spawn(session.clone(), store.clone());

        pair_session(&store, &session, None).await;
        wait_until(|| coordinator.has_loaded_settings()).await;

        seed_document(&store, &paths::content_filter("p1"), json!({
            "blockedKeywords": ["scary"],
            "maxDurationSeconds": 300,
        }))
        .await;
        wait_until(|| {
            coordinator
                .video_settings()
                .is_some_and(|s| s.max_duration_seconds == 300)
        })
        .await;
        let settings = coordinator.video_settings().unwrap();
        assert_eq!(settings.blocked_keywords, vec!["scary".to_string()]);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_decode_failure_retains_previous_snapshot() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        let coordinator = SettingsSyncCoordinator::spawn(session.clone(), store.clone());

        pair_session(&store, &session, None).await;
        seed_document(&store, &paths::music_filter("p1"), json!({
            "ageRating": "EIGHT_PLUS",
        }))
        .await;
        wait_until(|| {
            coordinator
                .music_settings()
                .is_some_and(|s| s.age_rating == AgeRating::EightPlus)
        })
        .await;

        // A malformed document must not replace the working snapshot.
        seed_document(&store, &paths::music_filter("p1"), json!({
            "ageRating": 8,
        }))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(
            coordinator.music_settings().unwrap().age_rating,
            AgeRating::EightPlus
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_per_child_settings_used_when_present() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;

        seed_document(&store, &paths::child_content_filter("p1", "c1"), json!({
            "maxDurationSeconds": 120,
        }))
        .await;
        seed_document(&store, &paths::content_filter("p1"), json!({
            "maxDurationSeconds": 999,
        }))
        .await;

        let coordinator = SettingsSyncCoordinator::spawn(session.clone(), store.clone());
        pair_session(&store, &session, Some("c1")).await;
        wait_until(|| coordinator.has_loaded_video_settings()).await;

        assert_eq!(
            coordinator.video_settings().unwrap().max_duration_seconds,
            120
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_registration_deletion_unpairs_and_raises_flag() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        let coordinator = SettingsSyncCoordinator::spawn(session.clone(), store.clone());

        pair_session(&store, &session, None).await;
        wait_until(|| coordinator.has_loaded_settings()).await;
        let device_id = session.device_id().await;

        store
            .delete(&paths::device_registration("p1", &device_id))
            .await
            .unwrap();
        wait_until(|| !session.is_paired()).await;

        assert!(coordinator.unlinked_by_caregiver());
        wait_until(|| coordinator.video_settings().is_none()).await;

        // Manual reset only; pairing state is untouched by the clear.
        coordinator.clear_unlinked_flag();
        assert!(!coordinator.unlinked_by_caregiver());
        assert!(!session.is_paired());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_reassignment_rebinds_to_new_child_path() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        let coordinator = SettingsSyncCoordinator::spawn(session.clone(), store.clone());

        pair_session(&store, &session, Some("c1")).await;
        wait_until(|| coordinator.has_loaded_settings()).await;
        let device_id = session.device_id().await;

        seed_document(&store, &paths::child_content_filter("p1", "c2"), json!({
            "maxDurationSeconds": 240,
        }))
        .await;

        let mut fields = Document::new();
        fields.insert("childId".into(), json!("c2"));
        store
            .update(&paths::device_registration("p1", &device_id), fields)
            .await
            .unwrap();

        wait_until(|| {
            coordinator
                .video_settings()
                .is_some_and(|s| s.max_duration_seconds == 240)
        })
        .await;
        match session.state() {
            PairingState::Paired {
                child_profile_id, ..
            } => assert_eq!(child_profile_id.as_deref(), Some("c2")),
            other => panic!("expected Paired, got {other:?}"),
        }
        // Reassignment to another child is not an unlink.
        assert!(!coordinator.unlinked_by_caregiver());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_child_removal_keeps_pairing_but_raises_flag() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        let coordinator = SettingsSyncCoordinator::spawn(session.clone(), store.clone());

        pair_session(&store, &session, Some("c1")).await;
        wait_until(|| coordinator.has_loaded_settings()).await;
        let device_id = session.device_id().await;

        let mut fields = Document::new();
        fields.insert("childId".into(), json!(null));
        store
            .update(&paths::device_registration("p1", &device_id), fields)
            .await
            .unwrap();

        wait_until(|| coordinator.unlinked_by_caregiver()).await;
        wait_until(|| match session.state() {
            PairingState::Paired {
                child_profile_id, ..
            } => child_profile_id.is_none(),
            _ => false,
        })
        .await;
        assert!(session.is_paired());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_parental_controls() {
        let store = InMemoryStore::new_shared();
        let session = new_session(store.clone()).await;
        let coordinator = SettingsSyncCoordinator::spawn(session.clone(), store.clone());

        assert!(matches!(
            coordinator.fetch_parental_controls().await,
            Err(SyncError::NotPaired)
        ));

        pair_session(&store, &session, None).await;
        // Absent document: defaults, not an error.
        let controls = coordinator.fetch_parental_controls().await.unwrap();
        assert_eq!(controls, ParentalControls::default());

        seed_document(&store, &paths::parental_controls("p1"), json!({
            "ageRating": "FIVE_PLUS",
            "screenTimeLimitMinutes": 60,
        }))
        .await;
        let controls = coordinator.fetch_parental_controls().await.unwrap();
        assert_eq!(controls.age_rating, AgeRating::FivePlus);
        assert_eq!(controls.screen_time_limit_minutes, 60);
        coordinator.shutdown().await;
    }
}
