//! Remote key-path store abstraction.
//!
//! The caregiver-facing backend is modelled as a document store addressed by
//! slash-separated key paths. This module defines the `RemoteStore` trait and
//! provides an in-memory implementation for testing and MVP use cases.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during remote store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("write rejected: {0}")]
    PermissionDenied(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

// ============================================================================
// Documents
// ============================================================================

/// A remote document: a flat JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

/// One delivery on a subscription stream. `Ok(None)` means the document is
/// absent at the subscribed path.
pub type DocEvent = Result<Option<Document>, StoreError>;

/// Encode a serializable value as a `Document`.
pub fn to_document<T: Serialize>(value: &T) -> Document {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Document::new(),
    }
}

/// Decode a `Document` into a typed value.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(doc))
}

// ============================================================================
// Key Paths
// ============================================================================

/// Builders for the key paths this core reads and writes.
///
/// Per-child paths exist alongside legacy (caregiver-wide) equivalents; the
/// sync layer decides which of the two applies.
pub mod paths {
    /// Caregiver-wide video filter settings.
    pub fn content_filter(caregiver: &str) -> String {
        format!("families/{caregiver}/settings/content_filter")
    }

    /// Per-child video filter settings.
    pub fn child_content_filter(caregiver: &str, child: &str) -> String {
        format!("families/{caregiver}/children/{child}/settings/content_filter")
    }

    /// Caregiver-wide music filter settings.
    pub fn music_filter(caregiver: &str) -> String {
        format!("families/{caregiver}/settings/music_filter")
    }

    /// Per-child music filter settings.
    pub fn child_music_filter(caregiver: &str, child: &str) -> String {
        format!("families/{caregiver}/children/{child}/settings/music_filter")
    }

    /// Caregiver-wide coarse parental controls.
    pub fn parental_controls(caregiver: &str) -> String {
        format!("families/{caregiver}/settings/parental_controls")
    }

    /// Per-child coarse parental controls.
    pub fn child_parental_controls(caregiver: &str, child: &str) -> String {
        format!("families/{caregiver}/children/{child}/settings/parental_controls")
    }

    /// Device registration under the caregiver's namespace. Deletion by the
    /// caregiver is the revocation signal.
    pub fn device_registration(caregiver: &str, device: &str) -> String {
        format!("families/{caregiver}/devices/{device}")
    }

    /// One-time pairing code record.
    pub fn pairing_code(code: &str) -> String {
        format!("pairing_codes/{code}")
    }

    /// Append-only video watch history record.
    pub fn watch_history(caregiver: &str, entry: &str) -> String {
        format!("families/{caregiver}/watch_history/{entry}")
    }

    /// Append-only music listen history record.
    pub fn music_history(caregiver: &str, entry: &str) -> String {
        format!("families/{caregiver}/music_history/{entry}")
    }

    /// Blocked-video alert record.
    pub fn block_alert(caregiver: &str, entry: &str) -> String {
        format!("families/{caregiver}/block_alerts/{entry}")
    }

    /// Blocked-track alert record.
    pub fn music_alert(caregiver: &str, entry: &str) -> String {
        format!("families/{caregiver}/music_alerts/{entry}")
    }
}

// ============================================================================
// Write Operations
// ============================================================================

/// A single operation inside a transaction.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Create or replace the document at `path`.
    Set { path: String, doc: Document },
    /// Merge `fields` into the existing document at `path`. Fails the
    /// transaction if the document is absent.
    Update { path: String, fields: Document },
    /// Delete the document at `path` (no-op if absent).
    Delete { path: String },
    /// Guard: fail the whole transaction with `StoreError::Conflict` unless
    /// the live document has `field == expected`.
    ExpectField {
        path: String,
        field: String,
        expected: Value,
    },
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Handle for a live document subscription.
///
/// The current document state is delivered immediately on subscribe, then
/// every subsequent change. Dropping the handle cancels the subscription.
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<DocEvent>,
}

impl Subscription {
    /// Receive the next delivery, or `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<DocEvent> {
        self.rx.recv().await
    }

    /// The path this subscription watches.
    pub fn path(&self) -> &str {
        &self.path
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Remote document store boundary.
///
/// Implementations are expected to be shared behind an `Arc` and safe to call
/// from any task.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Read the document at `path`, `None` if absent.
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// Create or replace the document at `path`.
    async fn set(&self, path: &str, doc: Document) -> Result<(), StoreError>;

    /// Merge `fields` into the existing document at `path`.
    async fn update(&self, path: &str, fields: Document) -> Result<(), StoreError>;

    /// Delete the document at `path` (succeeds if already absent).
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Open a subscription to the document at `path`. The current state is
    /// delivered immediately, then every change.
    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError>;

    /// Apply all operations atomically, or none of them.
    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

/// Thread-safe in-memory store implementation for testing and MVP.
///
/// Subscribers are plain unbounded senders pruned lazily once their receiver
/// side is gone. Read failures can be injected per path to exercise the sync
/// layer's fallback behavior.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    docs: Arc<RwLock<HashMap<String, Document>>>,
    subs: Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<DocEvent>>>>>,
    failing_reads: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make `get` (and the per-child probe) fail for `path` until cleared.
    pub async fn inject_read_failure(&self, path: &str) {
        self.failing_reads.write().await.insert(path.to_string());
    }

    /// Clear an injected read failure.
    pub async fn clear_read_failure(&self, path: &str) {
        self.failing_reads.write().await.remove(path);
    }

    /// Number of documents whose path starts with `prefix`. Test helper.
    pub async fn count_with_prefix(&self, prefix: &str) -> usize {
        let docs = self.docs.read().await;
        docs.keys().filter(|k| k.starts_with(prefix)).count()
    }

    async fn notify(&self, path: &str) {
        let event = {
            let docs = self.docs.read().await;
            docs.get(path).cloned()
        };
        let mut subs = self.subs.write().await;
        if let Some(senders) = subs.get_mut(path) {
            senders.retain(|tx| tx.send(Ok(event.clone())).is_ok());
            if senders.is_empty() {
                subs.remove(path);
            }
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        if self.failing_reads.read().await.contains(path) {
            return Err(StoreError::Connection(format!("injected failure: {path}")));
        }
        let docs = self.docs.read().await;
        Ok(docs.get(path).cloned())
    }

    async fn set(&self, path: &str, doc: Document) -> Result<(), StoreError> {
        {
            let mut docs = self.docs.write().await;
            docs.insert(path.to_string(), doc);
        }
        self.notify(path).await;
        Ok(())
    }

    async fn update(&self, path: &str, fields: Document) -> Result<(), StoreError> {
        {
            let mut docs = self.docs.write().await;
            let doc = docs
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            for (k, v) in fields {
                doc.insert(k, v);
            }
        }
        self.notify(path).await;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        {
            let mut docs = self.docs.write().await;
            docs.remove(path);
        }
        self.notify(path).await;
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = {
            let docs = self.docs.read().await;
            docs.get(path).cloned()
        };
        // Initial delivery mirrors snapshot-listener semantics.
        let _ = tx.send(Ok(initial));
        self.subs
            .write()
            .await
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription {
            path: path.to_string(),
            rx,
        })
    }

    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut touched: Vec<String> = Vec::new();
        {
            let mut docs = self.docs.write().await;

            // Validate everything before mutating anything.
            for op in &ops {
                match op {
                    WriteOp::ExpectField {
                        path,
                        field,
                        expected,
                    } => {
                        let live = docs
                            .get(path)
                            .and_then(|d| d.get(field))
                            .cloned()
                            .unwrap_or(Value::Null);
                        if &live != expected {
                            return Err(StoreError::Conflict(format!(
                                "{path}.{field} changed under transaction"
                            )));
                        }
                    }
                    WriteOp::Update { path, .. } => {
                        if !docs.contains_key(path) {
                            return Err(StoreError::NotFound(path.clone()));
                        }
                    }
                    WriteOp::Set { .. } | WriteOp::Delete { .. } => {}
                }
            }

            for op in ops {
                match op {
                    WriteOp::Set { path, doc } => {
                        docs.insert(path.clone(), doc);
                        touched.push(path);
                    }
                    WriteOp::Update { path, fields } => {
                        if let Some(doc) = docs.get_mut(&path) {
                            for (k, v) in fields {
                                doc.insert(k, v);
                            }
                        }
                        touched.push(path);
                    }
                    WriteOp::Delete { path } => {
                        docs.remove(&path);
                        touched.push(path);
                    }
                    WriteOp::ExpectField { .. } => {}
                }
            }
        }
        for path in touched {
            self.notify(&path).await;
        }
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.insert(k.to_string(), v.clone());
        }
        d
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryStore::new();
        store.set("a/b", doc(&[("x", json!(1))])).await.unwrap();

        let got = store.get("a/b").await.unwrap().unwrap();
        assert_eq!(got.get("x"), Some(&json!(1)));
        assert!(store.get("a/c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = InMemoryStore::new();
        store
            .set("a/b", doc(&[("x", json!(1)), ("y", json!(2))]))
            .await
            .unwrap();
        store.update("a/b", doc(&[("y", json!(3))])).await.unwrap();

        let got = store.get("a/b").await.unwrap().unwrap();
        assert_eq!(got.get("x"), Some(&json!(1)));
        assert_eq!(got.get("y"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_update_missing_doc_fails() {
        let store = InMemoryStore::new();
        let result = store.update("a/b", doc(&[("y", json!(3))])).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_state_and_changes() {
        let store = InMemoryStore::new();
        store.set("a/b", doc(&[("x", json!(1))])).await.unwrap();

        let mut sub = store.subscribe("a/b").await.unwrap();
        let initial = sub.next().await.unwrap().unwrap();
        assert!(initial.is_some());

        store.set("a/b", doc(&[("x", json!(2))])).await.unwrap();
        let updated = sub.next().await.unwrap().unwrap().unwrap();
        assert_eq!(updated.get("x"), Some(&json!(2)));

        store.delete("a/b").await.unwrap();
        let deleted = sub.next().await.unwrap().unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_absent_path_delivers_none() {
        let store = InMemoryStore::new();
        let mut sub = store.subscribe("missing/doc").await.unwrap();
        let initial = sub.next().await.unwrap().unwrap();
        assert!(initial.is_none());
    }

    #[tokio::test]
    async fn test_transaction_guard_conflict() {
        let store = InMemoryStore::new();
        store.set("codes/A", doc(&[("used", json!(true))])).await.unwrap();

        let result = store
            .transaction(vec![
                WriteOp::ExpectField {
                    path: "codes/A".into(),
                    field: "used".into(),
                    expected: json!(false),
                },
                WriteOp::Update {
                    path: "codes/A".into(),
                    fields: doc(&[("used", json!(true))]),
                },
            ])
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_transaction_applies_all_or_nothing() {
        let store = InMemoryStore::new();
        store.set("codes/A", doc(&[("used", json!(false))])).await.unwrap();

        // Update target absent: nothing must be written.
        let result = store
            .transaction(vec![
                WriteOp::Set {
                    path: "devices/d1".into(),
                    doc: doc(&[("ok", json!(true))]),
                },
                WriteOp::Update {
                    path: "codes/B".into(),
                    fields: doc(&[("used", json!(true))]),
                },
            ])
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(store.get("devices/d1").await.unwrap().is_none());

        store
            .transaction(vec![
                WriteOp::ExpectField {
                    path: "codes/A".into(),
                    field: "used".into(),
                    expected: json!(false),
                },
                WriteOp::Update {
                    path: "codes/A".into(),
                    fields: doc(&[("used", json!(true))]),
                },
                WriteOp::Set {
                    path: "devices/d1".into(),
                    doc: doc(&[("ok", json!(true))]),
                },
            ])
            .await
            .unwrap();
        assert!(store.get("devices/d1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let store = InMemoryStore::new();
        store.inject_read_failure("a/b").await;
        assert!(matches!(
            store.get("a/b").await,
            Err(StoreError::Connection(_))
        ));

        store.clear_read_failure("a/b").await;
        assert!(store.get("a/b").await.unwrap().is_none());
    }
}
