//! Test harness for KMC core functionality.
//!
//! Seeded-store fixtures and end-to-end flow helpers shared by the module
//! tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::pairing::{MemoryStateStore, PairingResult, PairingSession};
use crate::store::{paths, Document, InMemoryStore, RemoteStore};
use crate::sync::SettingsSyncCoordinator;
use crate::types::now_unix;

const WAIT_DEADLINE: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(10);

/// Poll `check` until it returns true. Panics after a few seconds.
pub async fn wait_until<F: Fn() -> bool>(check: F) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < WAIT_DEADLINE {
        if check() {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("condition not met within {WAIT_DEADLINE:?}");
}

/// Poll an async `check` until it returns true. Panics after a few seconds.
pub async fn wait_until_async<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < WAIT_DEADLINE {
        if check().await {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("condition not met within {WAIT_DEADLINE:?}");
}

/// Seed a document at `path` from a JSON object literal.
pub async fn seed_document(store: &InMemoryStore, path: &str, value: Value) {
    let doc = match value {
        Value::Object(map) => map,
        _ => Document::new(),
    };
    store.set(path, doc).await.expect("seed document");
}

/// Seed a one-time pairing code record. `child` is `(id, name)` when the
/// caregiver pre-assigned a child profile to the code.
pub async fn seed_pairing_code(
    store: &InMemoryStore,
    code: &str,
    caregiver: &str,
    child: Option<(&str, &str)>,
    expires_at: u64,
) {
    let mut doc = Document::new();
    doc.insert("parentUid".into(), json!(caregiver));
    if let Some((id, name)) = child {
        doc.insert("childId".into(), json!(id));
        doc.insert("childName".into(), json!(name));
    }
    doc.insert("used".into(), json!(false));
    doc.insert("expiresAt".into(), json!(expires_at));
    store
        .set(&paths::pairing_code(code), doc)
        .await
        .expect("seed pairing code");
}

/// Fresh session over an in-memory local record store.
pub async fn new_session(store: Arc<InMemoryStore>) -> PairingSession<InMemoryStore> {
    PairingSession::restore(store, MemoryStateStore::new_shared())
        .await
        .expect("restore session")
}

/// Seed a code for caregiver "p1" (child name "Nora" when assigned) and
/// redeem it on `session`.
pub async fn pair_session(
    store: &InMemoryStore,
    session: &PairingSession<InMemoryStore>,
    child_id: Option<&str>,
) {
    seed_pairing_code(
        store,
        "AB12CD",
        "p1",
        child_id.map(|id| (id, "Nora")),
        now_unix() + 600,
    )
    .await;
    let result = session.redeem_code("AB12CD", "Harness Child").await;
    assert!(
        matches!(result, PairingResult::Success { .. }),
        "pairing failed: {result:?}"
    );
}

/// Run a complete pair-and-sync flow:
/// 1. Fresh store and session
/// 2. Coordinator spawned
/// 3. Code redeemed for caregiver "p1"
/// 4. Both settings snapshots loaded
pub async fn run_sync_flow(
    child_id: Option<&str>,
) -> (
    Arc<InMemoryStore>,
    PairingSession<InMemoryStore>,
    SettingsSyncCoordinator<InMemoryStore>,
) {
    let store = InMemoryStore::new_shared();
    let session = new_session(store.clone()).await;
    let coordinator = SettingsSyncCoordinator::spawn(session.clone(), store.clone());
    pair_session(&store, &session, child_id).await;
    wait_until(|| coordinator.has_loaded_settings()).await;
    (store, session, coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{BlockedAttempt, EventReporter};
    use crate::global_rules::GlobalRuleSettings;
    use crate::policy::{evaluate_video, BlockReason};
    use crate::types::VideoCandidate;

    #[tokio::test]
    async fn test_full_flow_pair_sync_evaluate_report() {
        let (store, session, coordinator) = run_sync_flow(None).await;

        // Caregiver blocks a keyword; the device picks it up.
        seed_document(
            &store,
            &paths::content_filter("p1"),
            serde_json::json!({ "blockedKeywords": ["dinosaur"] }),
        )
        .await;
        wait_until(|| {
            coordinator
                .video_settings()
                .is_some_and(|s| !s.blocked_keywords.is_empty())
        })
        .await;

        let settings = coordinator.video_settings().expect("loaded settings");
        let candidate = VideoCandidate {
            video_id: "v1".into(),
            title: "Giant DINOSAUR attack".into(),
            channel_name: "Some Channel".into(),
            ..Default::default()
        };
        let result = evaluate_video(&candidate, &settings, &GlobalRuleSettings::default());
        assert_eq!(result.reason, Some(BlockReason::BlockedKeyword));

        // The blocked attempt reaches the caregiver's alert feed.
        let reporter = EventReporter::new(store.clone(), session.clone());
        reporter.report_blocked_video(
            BlockedAttempt {
                content_id: candidate.video_id.clone(),
                title: candidate.title.clone(),
                source: candidate.channel_name.clone(),
                reason: BlockReason::BlockedKeyword,
            },
            &settings,
        );
        wait_until_async(|| {
            let store = store.clone();
            async move { store.count_with_prefix("families/p1/block_alerts/").await == 1 }
        })
        .await;

        coordinator.shutdown().await;
    }
}
