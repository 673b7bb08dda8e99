//! Device pairing state machine.
//!
//! A caregiver generates a one-time code on the parent surface; the child
//! device redeems it to register itself under the caregiver's namespace.
//! The session owns the locally persisted pairing record (device id,
//! caregiver reference, child assignment) and publishes its state on a watch
//! channel for the sync layer.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::store::{paths, Document, RemoteStore, StoreError, WriteOp};
use crate::types::now_unix;

/// Pairing codes are exactly this long after normalization.
pub const CODE_LENGTH: usize = 6;

// ============================================================================
// Error Types
// ============================================================================

/// Why a pairing code was rejected. Caregiver-facing and recoverable by
/// re-entering a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCodeReason {
    /// Not six alphanumeric characters after normalization.
    Malformed,
    /// No such code record.
    NotFound,
    /// The code was already redeemed.
    AlreadyUsed,
    /// The code expired before redemption.
    Expired,
}

impl std::fmt::Display for InvalidCodeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidCodeReason::Malformed => write!(f, "malformed"),
            InvalidCodeReason::NotFound => write!(f, "not found"),
            InvalidCodeReason::AlreadyUsed => write!(f, "already used"),
            InvalidCodeReason::Expired => write!(f, "expired"),
        }
    }
}

/// Errors from the local pairing-record store.
#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for LocalStoreError {
    fn from(e: std::io::Error) -> Self {
        LocalStoreError::Io(e.to_string())
    }
}

// ============================================================================
// Records and States
// ============================================================================

/// The single locally persisted pairing record for this device. The device
/// id is generated once on first run and stays stable across pairings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PairingRecord {
    pub device_id: String,
    pub caregiver_ref: Option<String>,
    pub child_name: Option<String>,
    pub child_profile_id: Option<String>,
    pub is_paired: bool,
}

/// In-memory pairing state, derived from the record. `Pairing` is transient
/// while a code redemption is outstanding and always resolves to `Paired` or
/// `Unpaired`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    Pairing,
    Paired {
        caregiver_ref: String,
        device_id: String,
        child_name: Option<String>,
        child_profile_id: Option<String>,
    },
}

/// Outcome of a code redemption, surfaced as a value so the UI can present
/// specific guidance.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingResult {
    Success {
        caregiver_ref: String,
        device_id: String,
    },
    InvalidCode(InvalidCodeReason),
    Error(String),
}

/// Wire shape of a one-time pairing code record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PairingCodeDoc {
    #[serde(alias = "caregiverRef")]
    parent_uid: String,
    child_id: Option<String>,
    child_name: Option<String>,
    used: bool,
    used_by: Option<String>,
    used_at: Option<u64>,
    expires_at: u64,
}

// ============================================================================
// Local State Store
// ============================================================================

/// Persistence for the pairing record. One logical record per device.
#[async_trait]
pub trait LocalStateStore: Send + Sync {
    /// Load the record, `None` on first run.
    async fn load(&self) -> Result<Option<PairingRecord>, LocalStoreError>;

    /// Durably save the record. Returns only after the bytes are on disk.
    async fn save(&self, record: &PairingRecord) -> Result<(), LocalStoreError>;
}

/// JSON-file-backed record store.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LocalStateStore for FileStateStore {
    async fn load(&self) -> Result<Option<PairingRecord>, LocalStoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_str(&raw)
            .map_err(|e| LocalStoreError::Serialization(e.to_string()))?;
        Ok(Some(record))
    }

    async fn save(&self, record: &PairingRecord) -> Result<(), LocalStoreError> {
        let raw = serde_json::to_vec_pretty(record)
            .map_err(|e| LocalStoreError::Serialization(e.to_string()))?;
        let mut file = tokio::fs::File::create(&self.path).await?;
        file.write_all(&raw).await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// In-memory record store for tests.
#[derive(Default)]
pub struct MemoryStateStore {
    record: std::sync::Mutex<Option<PairingRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl LocalStateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<PairingRecord>, LocalStoreError> {
        let guard = self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.clone())
    }

    async fn save(&self, record: &PairingRecord) -> Result<(), LocalStoreError> {
        let mut guard = self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(record.clone());
        Ok(())
    }
}

// ============================================================================
// Pairing Session
// ============================================================================

/// Device-side pairing session.
///
/// Cheap to clone; clones share the same record, state channel and stores,
/// so the sync layer can hold a handle for revocation and reassignment.
pub struct PairingSession<S: RemoteStore> {
    store: Arc<S>,
    local: Arc<dyn LocalStateStore>,
    record: Arc<RwLock<PairingRecord>>,
    state_tx: Arc<watch::Sender<PairingState>>,
}

impl<S: RemoteStore> Clone for PairingSession<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            local: Arc::clone(&self.local),
            record: Arc::clone(&self.record),
            state_tx: Arc::clone(&self.state_tx),
        }
    }
}

fn state_of(record: &PairingRecord) -> PairingState {
    match (&record.caregiver_ref, record.is_paired) {
        (Some(caregiver), true) => PairingState::Paired {
            caregiver_ref: caregiver.clone(),
            device_id: record.device_id.clone(),
            child_name: record.child_name.clone(),
            child_profile_id: record.child_profile_id.clone(),
        },
        _ => PairingState::Unpaired,
    }
}

fn generate_device_id() -> Result<String, LocalStoreError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| LocalStoreError::Io(format!("rng failed: {e}")))?;
    Ok(hex::encode(bytes))
}

/// Normalize a caregiver-typed code: uppercase, strip separators. Returns
/// `None` unless the result is exactly six alphanumeric characters.
fn normalize_code(raw: &str) -> Option<String> {
    let code: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '_' | '.'))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if code.len() == CODE_LENGTH && code.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(code)
    } else {
        None
    }
}

impl<S: RemoteStore> PairingSession<S> {
    /// Restore the session from local state, generating and persisting a
    /// fresh device id on first run.
    pub async fn restore(
        store: Arc<S>,
        local: Arc<dyn LocalStateStore>,
    ) -> Result<Self, LocalStoreError> {
        let record = match local.load().await? {
            Some(record) if !record.device_id.is_empty() => record,
            _ => {
                let record = PairingRecord {
                    device_id: generate_device_id()?,
                    ..Default::default()
                };
                local.save(&record).await?;
                info!(device_id = %record.device_id, "generated new device identity");
                record
            }
        };

        let (state_tx, _) = watch::channel(state_of(&record));
        Ok(Self {
            store,
            local,
            record: Arc::new(RwLock::new(record)),
            state_tx: Arc::new(state_tx),
        })
    }

    /// Current state tag.
    pub fn state(&self) -> PairingState {
        self.state_tx.borrow().clone()
    }

    /// Watch the state for changes.
    pub fn subscribe_state(&self) -> watch::Receiver<PairingState> {
        self.state_tx.subscribe()
    }

    /// Pure read of the current state tag.
    pub fn is_paired(&self) -> bool {
        matches!(self.state(), PairingState::Paired { .. })
    }

    /// The stable device id.
    pub async fn device_id(&self) -> String {
        self.record.read().await.device_id.clone()
    }

    /// Redeem a pairing code against the remote authority.
    ///
    /// The session is `Pairing` while the redemption is in flight and always
    /// resolves to `Paired` or `Unpaired`; no partial "paired locally but not
    /// remotely" state is ever observable.
    pub async fn redeem_code(&self, raw_code: &str, proposed_child_name: &str) -> PairingResult {
        if !matches!(self.state(), PairingState::Unpaired) {
            return PairingResult::Error("can only redeem a code while unpaired".into());
        }
        let Some(code) = normalize_code(raw_code) else {
            return PairingResult::InvalidCode(InvalidCodeReason::Malformed);
        };

        self.state_tx.send_replace(PairingState::Pairing);
        let result = self.redeem_inner(&code, proposed_child_name).await;
        match &result {
            PairingResult::Success { .. } => {
                self.publish_state().await;
            }
            _ => {
                self.state_tx.send_replace(PairingState::Unpaired);
            }
        }
        result
    }

    async fn redeem_inner(&self, code: &str, proposed_child_name: &str) -> PairingResult {
        let code_path = paths::pairing_code(code);

        let doc = match self.store.get(&code_path).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return PairingResult::InvalidCode(InvalidCodeReason::NotFound),
            Err(e) => return PairingResult::Error(format!("code lookup failed: {e}")),
        };
        let code_doc: PairingCodeDoc = match crate::store::from_document(doc) {
            Ok(code_doc) => code_doc,
            Err(e) => return PairingResult::Error(format!("malformed code record: {e}")),
        };

        if code_doc.used {
            return PairingResult::InvalidCode(InvalidCodeReason::AlreadyUsed);
        }
        if code_doc.expires_at <= now_unix() {
            return PairingResult::InvalidCode(InvalidCodeReason::Expired);
        }
        if code_doc.parent_uid.is_empty() {
            return PairingResult::Error("code record has no caregiver reference".into());
        }

        let device_id = self.device_id().await;
        // The caregiver-authored child name wins over the caller's proposal.
        let proposed = proposed_child_name.trim();
        let child_name = code_doc
            .child_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| (!proposed.is_empty()).then(|| proposed.to_string()));

        let now = now_unix();
        let mut registration = Document::new();
        registration.insert("deviceId".into(), json!(device_id));
        registration.insert("childId".into(), json!(code_doc.child_id));
        registration.insert("childName".into(), json!(child_name));
        registration.insert("linkedAt".into(), json!(now));

        let mut code_update = Document::new();
        code_update.insert("used".into(), json!(true));
        code_update.insert("usedBy".into(), json!(device_id));
        code_update.insert("usedAt".into(), json!(now));

        let ops = vec![
            WriteOp::ExpectField {
                path: code_path.clone(),
                field: "used".into(),
                expected: Value::Bool(false),
            },
            WriteOp::Update {
                path: code_path,
                fields: code_update,
            },
            WriteOp::Set {
                path: paths::device_registration(&code_doc.parent_uid, &device_id),
                doc: registration,
            },
        ];
        match self.store.transaction(ops).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return PairingResult::InvalidCode(InvalidCodeReason::AlreadyUsed);
            }
            Err(e) => return PairingResult::Error(format!("pairing write failed: {e}")),
        }

        let snapshot = {
            let mut record = self.record.write().await;
            record.caregiver_ref = Some(code_doc.parent_uid.clone());
            record.child_name = child_name;
            record.child_profile_id = code_doc.child_id.clone();
            record.is_paired = true;
            record.clone()
        };
        if let Err(e) = self.local.save(&snapshot).await {
            // The remote link exists; a lost local save is repaired by the
            // revocation path on a later restart.
            warn!(error = %e, "failed to persist pairing record");
        }

        info!(caregiver = %code_doc.parent_uid, device_id = %device_id, "device paired");
        PairingResult::Success {
            caregiver_ref: code_doc.parent_uid,
            device_id,
        }
    }

    /// Unpair this device: best-effort removal of the remote registration,
    /// then an unconditional local reset.
    pub async fn unpair(&self) {
        let (caregiver, device_id) = {
            let record = self.record.read().await;
            (record.caregiver_ref.clone(), record.device_id.clone())
        };
        if let Some(caregiver) = caregiver {
            let path = paths::device_registration(&caregiver, &device_id);
            if let Err(e) = self.store.delete(&path).await {
                warn!(error = %e, "failed to remove remote registration");
            }
        }
        self.reset_to_unpaired().await;
        info!("device unpaired");
    }

    /// Remote revocation: the caregiver removed this device's registration.
    pub(crate) async fn handle_remote_revocation(&self) {
        info!("registration removed by caregiver, unpairing");
        self.reset_to_unpaired().await;
    }

    /// Apply a caregiver-side child reassignment. Persists the record before
    /// republishing state, so a restart observes the new assignment. Returns
    /// false when the assignment did not change.
    pub(crate) async fn apply_reassignment(&self, child_profile_id: Option<String>) -> bool {
        let snapshot = {
            let mut record = self.record.write().await;
            if record.child_profile_id == child_profile_id {
                return false;
            }
            record.child_profile_id = child_profile_id;
            record.clone()
        };
        if let Err(e) = self.local.save(&snapshot).await {
            warn!(error = %e, "failed to persist reassigned pairing record");
        }
        info!(child = ?snapshot.child_profile_id, "child assignment changed");
        self.publish_state().await;
        true
    }

    async fn reset_to_unpaired(&self) {
        let snapshot = {
            let mut record = self.record.write().await;
            record.caregiver_ref = None;
            record.child_name = None;
            record.child_profile_id = None;
            record.is_paired = false;
            record.clone()
        };
        if let Err(e) = self.local.save(&snapshot).await {
            warn!(error = %e, "failed to persist unpaired record");
        }
        self.state_tx.send_replace(PairingState::Unpaired);
    }

    async fn publish_state(&self) {
        let state = state_of(&*self.record.read().await);
        self.state_tx.send_replace(state);
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
