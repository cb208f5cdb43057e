//! Citation resolution against the synced file mapping.
//!
//! The sync tooling that uploads documents to the upstream knowledge store
//! also writes a single JSON mapping document (canonical source path →
//! `{fileName, sourcePath, sharePointUrl}`). The model only hands back a
//! display title per grounding reference, so turning a citation into a
//! clickable link means matching that title against the mapping.
//!
//! The mapping is fetched wholesale and cached in memory with a fixed TTL
//! (5 minutes by default). A lookup that observes an expired snapshot
//! triggers one synchronous refresh; if the refresh fails, the stale
//! snapshot is served and the failure is logged. Resolution therefore
//! degrades to "no link" and never fails a chat turn.
//!
//! # Matching Strategy
//!
//! Tried in order, first hit wins:
//!
//! 1. Exact match on a mapping key (canonical source path).
//! 2. Exact match on an entry's file name.
//! 3. Bidirectional substring match: the title contains the file name
//!    (with or without its extension), or the file name contains the title.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::MappingConfig;
use crate::models::FileMapping;

/// Injectable time source so TTL behavior is testable with a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Production clock backed by `Instant::now`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Fetches the full mapping document from wherever it lives.
#[async_trait]
pub trait MappingFetcher: Send + Sync {
    async fn fetch(&self) -> Result<FileMapping>;
}

/// Fetches the mapping document over HTTP from an object-store URL.
pub struct HttpMappingFetcher {
    url: String,
    client: reqwest::Client,
}

impl HttpMappingFetcher {
    pub fn new(config: &MappingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url: config.url.clone(),
            client,
        })
    }
}

#[async_trait]
impl MappingFetcher for HttpMappingFetcher {
    async fn fetch(&self) -> Result<FileMapping> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch file mapping from {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("File mapping fetch returned {}: {}", status, body);
        }

        let mapping: FileMapping = response
            .json()
            .await
            .context("Failed to parse file mapping document")?;
        Ok(mapping)
    }
}

struct CachedMapping {
    snapshot: Arc<FileMapping>,
    fetched_at: Instant,
}

/// Resolves citation titles to stable external URLs via the cached mapping.
pub struct CitationResolver {
    fetcher: Box<dyn MappingFetcher>,
    clock: Box<dyn Clock>,
    ttl: Duration,
    cache: tokio::sync::Mutex<Option<CachedMapping>>,
}

impl CitationResolver {
    pub fn new(fetcher: Box<dyn MappingFetcher>, clock: Box<dyn Clock>, ttl: Duration) -> Self {
        Self {
            fetcher,
            clock,
            ttl,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Resolve a citation title to its external URL, if any.
    ///
    /// Deterministic for a fixed mapping snapshot. Returns `None` when no
    /// strategy matches or when no snapshot could ever be fetched.
    pub async fn resolve(&self, title: &str) -> Option<String> {
        let snapshot = self.snapshot().await?;
        let url = match_title(&snapshot, title);
        if url.is_none() {
            debug!(title, "no mapping entry matched citation title");
        }
        url
    }

    /// Drop the cached snapshot so the next lookup refreshes.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        *cache = None;
        info!("file mapping cache invalidated");
    }

    /// Current snapshot, refreshing if missing or older than the TTL.
    ///
    /// Refresh failures are logged and the previous snapshot (if any) is
    /// served. Concurrent refreshes are not coordinated; the mapping is an
    /// eventually-consistent external document and the later write wins.
    async fn snapshot(&self) -> Option<Arc<FileMapping>> {
        let now = self.clock.now();

        let stale = {
            let cache = self.cache.lock().await;
            match cache.as_ref() {
                Some(cached) if now.duration_since(cached.fetched_at) < self.ttl => {
                    return Some(cached.snapshot.clone());
                }
                Some(cached) => Some(cached.snapshot.clone()),
                None => None,
            }
        };

        match self.fetcher.fetch().await {
            Ok(mapping) => {
                info!(entries = mapping.len(), "refreshed file mapping");
                let snapshot = Arc::new(mapping);
                let mut cache = self.cache.lock().await;
                *cache = Some(CachedMapping {
                    snapshot: snapshot.clone(),
                    fetched_at: self.clock.now(),
                });
                Some(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "file mapping refresh failed");
                // Push the timestamp forward so every lookup in the next TTL
                // window is served from the stale snapshot without another
                // refresh attempt.
                if let Some(stale) = stale {
                    let mut cache = self.cache.lock().await;
                    *cache = Some(CachedMapping {
                        snapshot: stale.clone(),
                        fetched_at: self.clock.now(),
                    });
                    Some(stale)
                } else {
                    None
                }
            }
        }
    }
}

/// Apply the ordered matching strategies to one title.
fn match_title(mapping: &FileMapping, title: &str) -> Option<String> {
    let title = title.trim();
    if title.is_empty() {
        return None;
    }

    // 1. Exact match on the canonical source path key.
    if let Some(entry) = mapping.get(title) {
        return Some(entry.share_point_url.clone());
    }

    // 2. Exact match on a file name.
    if let Some(entry) = mapping.values().find(|e| e.file_name == title) {
        return Some(entry.share_point_url.clone());
    }

    // 3. Bidirectional substring match, extension-stripped included.
    mapping
        .values()
        .find(|e| {
            let stem = file_stem(&e.file_name);
            title.contains(e.file_name.as_str())
                || (!stem.is_empty() && title.contains(stem))
                || e.file_name.contains(title)
        })
        .map(|e| e.share_point_url.clone())
}

/// File name without its final extension (`"B.pdf"` → `"B"`).
fn file_stem(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => file_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MappingEntry;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Clock that only moves when the test advances it.
    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }
    }

    struct ManualClockHandle(Arc<ManualClock>);

    impl ManualClockHandle {
        fn advance(&self, d: Duration) {
            *self.0.offset.lock().unwrap() += d;
        }
    }

    impl Clock for Arc<ManualClock> {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    /// Fetcher that counts calls and can be switched to failing.
    struct ScriptedFetcher {
        mapping: FileMapping,
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl ScriptedFetcher {
        fn new(mapping: FileMapping) -> Arc<Self> {
            Arc::new(Self {
                mapping,
                calls: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl MappingFetcher for Arc<ScriptedFetcher> {
        async fn fetch(&self) -> Result<FileMapping> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("object store unavailable");
            }
            Ok(self.mapping.clone())
        }
    }

    fn entry(file_name: &str, path: &str, url: &str) -> MappingEntry {
        MappingEntry {
            file_name: file_name.to_string(),
            source_path: path.to_string(),
            share_point_url: url.to_string(),
        }
    }

    fn sample_mapping() -> FileMapping {
        let mut m = HashMap::new();
        m.insert("A/B.pdf".to_string(), entry("B.pdf", "A/B.pdf", "U"));
        m
    }

    fn resolver_with(
        mapping: FileMapping,
        ttl: Duration,
    ) -> (CitationResolver, Arc<ScriptedFetcher>, ManualClockHandle) {
        let fetcher = ScriptedFetcher::new(mapping);
        let clock = Arc::new(ManualClock::new());
        let resolver = CitationResolver::new(
            Box::new(fetcher.clone()),
            Box::new(clock.clone()),
            ttl,
        );
        (resolver, fetcher, ManualClockHandle(clock))
    }

    #[tokio::test]
    async fn test_matching_strategy_order() {
        let (resolver, _fetcher, _clock) =
            resolver_with(sample_mapping(), Duration::from_secs(300));

        // Strategy 1: exact key.
        assert_eq!(resolver.resolve("A/B.pdf").await.as_deref(), Some("U"));
        // Strategy 2: exact file name.
        assert_eq!(resolver.resolve("B.pdf").await.as_deref(), Some("U"));
        // Strategy 3: title contains the extension-stripped file name.
        assert_eq!(resolver.resolve("Report: B").await.as_deref(), Some("U"));
        // No strategy matches.
        assert_eq!(resolver.resolve("C.pdf").await, None);
    }

    #[tokio::test]
    async fn test_file_name_contains_title() {
        let mut mapping = HashMap::new();
        mapping.insert(
            "docs/handbook.md".to_string(),
            entry("handbook.md", "docs/handbook.md", "H"),
        );
        let (resolver, _fetcher, _clock) = resolver_with(mapping, Duration::from_secs(300));

        assert_eq!(resolver.resolve("handbook").await.as_deref(), Some("H"));
        assert_eq!(resolver.resolve("   ").await, None);
    }

    #[tokio::test]
    async fn test_cached_within_ttl_single_fetch() {
        let (resolver, fetcher, clock) = resolver_with(sample_mapping(), Duration::from_secs(300));

        for _ in 0..5 {
            assert_eq!(resolver.resolve("B.pdf").await.as_deref(), Some("U"));
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // Still inside the TTL window.
        clock.advance(Duration::from_secs(299));
        resolver.resolve("B.pdf").await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_after_ttl_expiry() {
        let (resolver, fetcher, clock) = resolver_with(sample_mapping(), Duration::from_secs(300));

        resolver.resolve("B.pdf").await;
        clock.advance(Duration::from_secs(301));
        resolver.resolve("B.pdf").await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_snapshot_served_on_refresh_failure() {
        let (resolver, fetcher, clock) = resolver_with(sample_mapping(), Duration::from_secs(300));

        assert_eq!(resolver.resolve("B.pdf").await.as_deref(), Some("U"));

        fetcher.fail.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(301));

        // Exactly one refresh attempt, then the stale snapshot is served.
        assert_eq!(resolver.resolve("B.pdf").await.as_deref(), Some("U"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        // The failed refresh re-arms the TTL; no immediate retry storm.
        assert_eq!(resolver.resolve("B.pdf").await.as_deref(), Some("U"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_snapshot_and_fetch_failing_resolves_none() {
        let (resolver, fetcher, _clock) = resolver_with(sample_mapping(), Duration::from_secs(300));
        fetcher.fail.store(true, Ordering::SeqCst);

        assert_eq!(resolver.resolve("B.pdf").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let (resolver, fetcher, _clock) = resolver_with(sample_mapping(), Duration::from_secs(300));

        resolver.resolve("B.pdf").await;
        resolver.invalidate().await;
        resolver.resolve("B.pdf").await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
