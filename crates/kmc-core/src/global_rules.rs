//! Operator-controlled global rule cache.
//!
//! Platform-wide block lists and feature flags, independent of any caregiver
//! or pairing state. Refreshed on a throttled interval from a pluggable
//! fetcher; readers always see the last-known-good snapshot, swapped as a
//! whole so a refresh is never observable half-applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::policy::{keyword_hit, names_match};

/// Default minimum interval between remote fetches.
pub const DEFAULT_MIN_FETCH_INTERVAL: Duration = Duration::from_secs(3600);

// Remote config keys.
const KEY_BLOCKED_KEYWORDS: &str = "blocked_keywords";
const KEY_BLOCKED_CHANNELS: &str = "blocked_channels";
const KEY_BLOCKED_ARTISTS: &str = "blocked_artists";
const KEY_MAINTENANCE_MODE: &str = "maintenance_mode";
const KEY_MIN_APP_VERSION: &str = "min_app_version";
const FEATURE_PREFIX: &str = "feature_";

// ============================================================================
// Fetcher Trait
// ============================================================================

/// Source of the raw operator config values, keyed by name. List values are
/// comma-separated strings.
#[async_trait]
pub trait RuleFetcher: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<HashMap<String, String>>;
}

// ============================================================================
// Rule Snapshot
// ============================================================================

/// Decoded operator rule snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalRuleSettings {
    pub blocked_keywords: Vec<String>,
    /// Channel ids or names.
    pub blocked_channels: Vec<String>,
    /// Artist ids or names.
    pub blocked_artists: Vec<String>,
    pub maintenance_mode: bool,
    pub min_app_version: String,
    pub feature_flags: HashMap<String, bool>,
}

impl GlobalRuleSettings {
    /// True if `text` contains any operator-blocked keyword.
    pub fn is_blocked(&self, text: &str) -> bool {
        keyword_hit(text, &self.blocked_keywords).is_some()
    }

    /// True if the channel is operator-blocked, by exact id or lenient name.
    pub fn is_channel_blocked(&self, id: &str, name: &str) -> bool {
        entry_match(id, name, &self.blocked_channels)
    }

    /// True if the artist is operator-blocked, by exact id or lenient name.
    pub fn is_artist_blocked(&self, id: &str, name: &str) -> bool {
        entry_match(id, name, &self.blocked_artists)
    }

    /// Feature flag value, false when unset.
    pub fn feature_enabled(&self, name: &str) -> bool {
        self.feature_flags.get(name).copied().unwrap_or(false)
    }
}

fn entry_match(id: &str, name: &str, entries: &[String]) -> bool {
    let id = id.trim().to_lowercase();
    entries.iter().any(|entry| {
        (!id.is_empty() && entry.trim().to_lowercase() == id) || names_match(name, entry)
    })
}

/// Split a comma-separated value, trimming entries and dropping empties.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn decode(values: &HashMap<String, String>) -> GlobalRuleSettings {
    let mut settings = GlobalRuleSettings::default();
    for (key, value) in values {
        match key.as_str() {
            KEY_BLOCKED_KEYWORDS => settings.blocked_keywords = parse_list(value),
            KEY_BLOCKED_CHANNELS => settings.blocked_channels = parse_list(value),
            KEY_BLOCKED_ARTISTS => settings.blocked_artists = parse_list(value),
            KEY_MAINTENANCE_MODE => settings.maintenance_mode = parse_bool(value),
            KEY_MIN_APP_VERSION => settings.min_app_version = value.trim().to_string(),
            other => {
                if let Some(flag) = other.strip_prefix(FEATURE_PREFIX) {
                    settings
                        .feature_flags
                        .insert(flag.to_string(), parse_bool(value));
                }
            }
        }
    }
    settings
}

// ============================================================================
// Cache
// ============================================================================

/// Process-wide cache of the operator rule snapshot.
///
/// Reads are synchronous and lock-free apart from the snapshot pointer swap.
pub struct GlobalRuleCache {
    fetcher: Arc<dyn RuleFetcher>,
    current: RwLock<Arc<GlobalRuleSettings>>,
    last_attempt: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl GlobalRuleCache {
    /// Create a cache with the default one-hour fetch throttle. The snapshot
    /// starts at the built-in defaults until the first successful refresh.
    pub fn new(fetcher: Arc<dyn RuleFetcher>) -> Self {
        Self::with_min_interval(fetcher, DEFAULT_MIN_FETCH_INTERVAL)
    }

    /// Create a cache with a custom fetch throttle.
    pub fn with_min_interval(fetcher: Arc<dyn RuleFetcher>, min_interval: Duration) -> Self {
        Self {
            fetcher,
            current: RwLock::new(Arc::new(GlobalRuleSettings::default())),
            last_attempt: Mutex::new(None),
            min_interval,
        }
    }

    /// Refresh from the fetcher, throttled to the minimum interval.
    ///
    /// Returns true only when the fetched values actually changed the
    /// snapshot. Fetch failures keep the last-known-good value.
    pub async fn refresh(&self) -> bool {
        {
            let mut last = lock_recover(&self.last_attempt);
            if let Some(at) = *last {
                if at.elapsed() < self.min_interval {
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        let values = match self.fetcher.fetch().await {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "global rule fetch failed, keeping last snapshot");
                return false;
            }
        };

        let next = Arc::new(decode(&values));
        let mut current = write_recover(&self.current);
        if *next == **current {
            return false;
        }
        debug!(
            keywords = next.blocked_keywords.len(),
            channels = next.blocked_channels.len(),
            artists = next.blocked_artists.len(),
            "global rules updated"
        );
        *current = next;
        true
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<GlobalRuleSettings> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// True if `text` contains any operator-blocked keyword.
    pub fn is_blocked(&self, text: &str) -> bool {
        self.current().is_blocked(text)
    }

    /// True if the channel is operator-blocked.
    pub fn is_channel_blocked(&self, id: &str, name: &str) -> bool {
        self.current().is_channel_blocked(id, name)
    }

    /// True if the artist is operator-blocked.
    pub fn is_artist_blocked(&self, id: &str, name: &str) -> bool {
        self.current().is_artist_blocked(id, name)
    }
}

fn lock_recover<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_recover<'a, T>(lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        values: Mutex<HashMap<String, String>>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn new(pairs: &[(&str, &str)]) -> Arc<Self> {
            let values = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Arc::new(Self {
                values: Mutex::new(values),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, key: &str, value: &str) {
            lock_recover(&self.values).insert(key.to_string(), value.to_string());
        }
    }

    #[async_trait]
    impl RuleFetcher for StaticFetcher {
        async fn fetch(&self) -> anyhow::Result<HashMap<String, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(lock_recover(&self.values).clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl RuleFetcher for FailingFetcher {
        async fn fetch(&self) -> anyhow::Result<HashMap<String, String>> {
            anyhow::bail!("remote config unavailable")
        }
    }

    #[test]
    fn test_parse_list_trims_and_drops_empties() {
        assert_eq!(
            parse_list(" a, b ,, c ,"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_list("").is_empty());
        assert!(parse_list(" , ,").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_decodes_and_reports_change() {
        let fetcher = StaticFetcher::new(&[
            ("blocked_keywords", "gore, gambling"),
            ("blocked_channels", "UC123, Prank Channel"),
            ("blocked_artists", "Explicit Band"),
            ("maintenance_mode", "false"),
            ("min_app_version", "2.1.0"),
            ("feature_music_filters", "true"),
        ]);
        let cache = GlobalRuleCache::with_min_interval(fetcher.clone(), Duration::ZERO);

        assert!(cache.refresh().await);
        let snapshot = cache.current();
        assert_eq!(snapshot.blocked_keywords.len(), 2);
        assert_eq!(snapshot.min_app_version, "2.1.0");
        assert!(snapshot.feature_enabled("music_filters"));
        assert!(!snapshot.feature_enabled("missing"));
        assert!(!snapshot.maintenance_mode);

        // Same values: no change reported.
        assert!(!cache.refresh().await);

        fetcher.set("maintenance_mode", "true");
        assert!(cache.refresh().await);
        assert!(cache.current().maintenance_mode);
    }

    #[tokio::test]
    async fn test_refresh_is_throttled() {
        let fetcher = StaticFetcher::new(&[("blocked_keywords", "x")]);
        let cache =
            GlobalRuleCache::with_min_interval(fetcher.clone(), Duration::from_secs(3600));

        assert!(cache.refresh().await);
        assert!(!cache.refresh().await);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_last_known_good() {
        let cache =
            GlobalRuleCache::with_min_interval(Arc::new(FailingFetcher), Duration::ZERO);
        assert!(!cache.refresh().await);
        assert_eq!(*cache.current(), GlobalRuleSettings::default());
    }

    #[tokio::test]
    async fn test_blocked_reads() {
        let fetcher = StaticFetcher::new(&[
            ("blocked_keywords", "casino"),
            ("blocked_channels", "UCBAD, Bad Kids TV"),
            ("blocked_artists", "Shock Rock"),
        ]);
        let cache = GlobalRuleCache::with_min_interval(fetcher, Duration::ZERO);
        cache.refresh().await;

        assert!(cache.is_blocked("Big CASINO wins"));
        assert!(!cache.is_blocked("calm piano"));
        assert!(cache.is_channel_blocked("ucbad", "whatever"));
        assert!(cache.is_channel_blocked("", "Bad Kids"));
        assert!(cache.is_artist_blocked("", "shock rock band"));
        assert!(!cache.is_artist_blocked("", "Nice Band"));
    }
}
