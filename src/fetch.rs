//! Cache/store-then-upstream decision flow shared by every endpoint.
//!
//! `FetchService` owns no mutable state of its own. Blocking work (SQLite,
//! `ureq`) is pushed onto the blocking pool; consistency for concurrent
//! requests on the same video comes from the store's single-statement writes.

use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::task::{self, JoinError};

use crate::{
    cache::{self, CacheBackend, CacheEntry, COMMON_CAPTION_LANGUAGES},
    error::FetchError,
    transcripts::{Transcript, TranscriptStore, timestamp_now},
    upstream::{Upstream, UpstreamError, VideoMetadata},
    video_id::VideoId,
};

pub const DEFAULT_LANGUAGES: &str = "en";

/// Where a transcript returned by [`FetchService::fetch_transcript`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Database,
    Upstream,
}

/// A value plus, when it was served from the cache, its age in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub cache_age: Option<u64>,
}

impl<T> Cached<T> {
    pub fn is_cached(&self) -> bool {
        self.cache_age.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionsResult {
    pub video_id: String,
    pub languages: String,
    pub captions: String,
}

/// Shape of a captions entry inside the cache.
#[derive(Serialize, Deserialize)]
struct CachedCaptions {
    captions: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub backend: &'static str,
    pub ttl_seconds: u64,
}

/// Empty language lists fall back to [`DEFAULT_LANGUAGES`]; anything else is
/// passed to the provider verbatim.
fn normalize_languages(languages: &str) -> String {
    if languages.is_empty() {
        DEFAULT_LANGUAGES.to_owned()
    } else {
        languages.to_owned()
    }
}

/// First non-empty entry of a comma separated language list.
pub fn primary_language(languages: &str) -> String {
    languages
        .split(',')
        .map(str::trim)
        .find(|lang| !lang.is_empty())
        .unwrap_or(DEFAULT_LANGUAGES)
        .to_owned()
}

fn join_failed(err: JoinError) -> FetchError {
    FetchError::Internal(anyhow!("task join error: {err}"))
}

async fn run_blocking<T, F>(f: F) -> Result<T, FetchError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(join_failed)?
        .map_err(FetchError::Internal)
}

pub struct FetchService {
    store: TranscriptStore,
    upstream: Arc<dyn Upstream>,
    cache: Arc<dyn CacheBackend>,
    cache_ttl: Duration,
}

impl FetchService {
    pub fn new(
        store: TranscriptStore,
        upstream: Arc<dyn Upstream>,
        cache: Arc<dyn CacheBackend>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            upstream,
            cache,
            cache_ttl,
        }
    }

    /// Returns the stored transcript for `video`, going to the provider only
    /// when nothing is stored yet or `force` is set.
    pub async fn fetch_transcript(
        &self,
        video: &str,
        languages: &str,
        force: bool,
    ) -> Result<(Transcript, Source), FetchError> {
        let id = VideoId::extract(video).ok_or_else(FetchError::invalid_reference)?;
        let languages = normalize_languages(languages);

        if !force {
            let store = self.store.clone();
            let key = id.to_string();
            let existing = run_blocking(move || {
                if store.find_by_video_id(&key)?.is_none() {
                    return Ok(None);
                }
                // A concurrent delete between the two calls yields None and
                // we fall through to the provider.
                store.get_and_touch(&key)
            })
            .await?;

            if let Some(transcript) = existing {
                debug!("transcript {id} served from database");
                return Ok((transcript, Source::Database));
            }
        }

        let captions = {
            let upstream = Arc::clone(&self.upstream);
            let (id, languages) = (id.clone(), languages.clone());
            task::spawn_blocking(move || upstream.captions(&id, &languages))
        };
        let metadata = {
            let upstream = Arc::clone(&self.upstream);
            let id = id.clone();
            task::spawn_blocking(move || upstream.metadata(&id))
        };
        let timestamps = {
            let upstream = Arc::clone(&self.upstream);
            let (id, languages) = (id.clone(), languages.clone());
            task::spawn_blocking(move || upstream.timestamps(&id, &languages))
        };
        let (captions, metadata, timestamps) = tokio::join!(captions, metadata, timestamps);

        let captions = captions.map_err(join_failed)?.inspect_err(|err| {
            warn!("transcript {id}: {err}");
        })?;
        let metadata = metadata.map_err(join_failed)?.inspect_err(|err| {
            warn!("transcript {id}: {err}");
        })?;
        let timestamps = match timestamps {
            Ok(Ok(entries)) => Some(entries),
            Ok(Err(err)) => {
                debug!("transcript {id}: continuing without timestamps: {err}");
                None
            }
            Err(err) => {
                warn!("transcript {id}: timestamps task failed: {err}");
                None
            }
        };

        let now = timestamp_now();
        let transcript = Transcript {
            video_id: id.to_string(),
            captions,
            language: primary_language(&languages),
            title: metadata.title,
            author: metadata.author,
            thumbnail_url: metadata.thumbnail_url,
            source_url: video.to_owned(),
            timestamps,
            fetch_count: 1,
            created_at: now.clone(),
            last_accessed: now,
        };

        let store = self.store.clone();
        let stored = run_blocking(move || store.upsert(&transcript)).await?;
        info!(
            "stored transcript {} from upstream (fetch_count {})",
            stored.video_id, stored.fetch_count
        );
        Ok((stored, Source::Upstream))
    }

    /// Single-item read; counts as an access.
    pub async fn get_transcript(&self, video_id: &str) -> Result<Transcript, FetchError> {
        let id = VideoId::parse_exact(video_id).ok_or_else(FetchError::invalid_id_format)?;
        let store = self.store.clone();
        let key = id.to_string();
        run_blocking(move || store.get_and_touch(&key))
            .await?
            .ok_or_else(|| FetchError::transcript_not_found(id.as_str()))
    }

    /// Listing never counts as an access.
    pub async fn list_transcripts(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Transcript>, u64), FetchError> {
        let store = self.store.clone();
        run_blocking(move || store.list(limit, offset)).await
    }

    pub async fn delete_transcript(&self, video_id: &str) -> Result<Transcript, FetchError> {
        let id = VideoId::parse_exact(video_id).ok_or_else(FetchError::invalid_id_format)?;
        let store = self.store.clone();
        let key = id.to_string();
        let deleted = run_blocking(move || store.delete(&key))
            .await?
            .ok_or_else(|| FetchError::transcript_not_found(id.as_str()))?;
        info!("deleted transcript {}", deleted.video_id);
        Ok(deleted)
    }

    pub async fn metadata(&self, video: &str) -> Result<Cached<VideoMetadata>, FetchError> {
        let id = VideoId::extract(video).ok_or_else(FetchError::invalid_reference)?;
        let upstream = Arc::clone(&self.upstream);
        let lookup = id.clone();
        self.cached_or_fetch(cache::metadata_key(&id), move || upstream.metadata(&lookup))
            .await
    }

    pub async fn captions(
        &self,
        video: &str,
        languages: &str,
    ) -> Result<Cached<CaptionsResult>, FetchError> {
        let id = VideoId::extract(video).ok_or_else(FetchError::invalid_reference)?;
        let languages = normalize_languages(languages);
        let upstream = Arc::clone(&self.upstream);
        let (lookup, requested) = (id.clone(), languages.clone());
        let cached = self
            .cached_or_fetch(cache::captions_key(&id, &languages), move || {
                upstream
                    .captions(&lookup, &requested)
                    .map(|captions| CachedCaptions { captions })
            })
            .await?;

        Ok(Cached {
            value: CaptionsResult {
                video_id: id.to_string(),
                languages,
                captions: cached.value.captions,
            },
            cache_age: cached.cache_age,
        })
    }

    /// Drops the metadata entry and the common single-language caption
    /// entries for `video_id`. Returns the keys that were cleared.
    pub async fn clear_cache(&self, video_id: &str) -> Result<Vec<String>, FetchError> {
        let id = VideoId::parse_exact(video_id).ok_or_else(FetchError::invalid_id_format)?;
        if !self.cache.is_enabled() {
            return Ok(Vec::new());
        }

        let mut keys = vec![cache::metadata_key(&id)];
        keys.extend(
            COMMON_CAPTION_LANGUAGES
                .iter()
                .map(|lang| cache::captions_key(&id, lang)),
        );

        let cache = Arc::clone(&self.cache);
        let cleared = keys.clone();
        run_blocking(move || {
            for key in &cleared {
                cache.delete(key)?;
            }
            Ok(())
        })
        .await?;

        info!("cleared {} cache keys for {id}", keys.len());
        Ok(keys)
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.cache.is_enabled(),
            backend: self.cache.backend_name(),
            ttl_seconds: self.cache_ttl.as_secs(),
        }
    }

    async fn cached_or_fetch<T, F>(&self, key: String, fetch: F) -> Result<Cached<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Result<T, UpstreamError> + Send + 'static,
    {
        if let Some(entry) = self.cache_get(&key).await {
            match serde_json::from_value::<T>(entry.data.clone()) {
                Ok(value) => {
                    debug!("cache hit {key}");
                    return Ok(Cached {
                        value,
                        cache_age: Some(entry.age_secs()),
                    });
                }
                Err(err) => warn!("ignoring unreadable cache entry {key}: {err}"),
            }
        }

        debug!("cache miss {key}");
        let value = task::spawn_blocking(fetch)
            .await
            .map_err(join_failed)?
            .map_err(|err| {
                warn!("{key}: {err}");
                FetchError::UpstreamLookup(err)
            })?;

        match serde_json::to_value(&value) {
            Ok(data) => self.cache_put(key, data).await,
            Err(err) => warn!("not caching {key}: {err}"),
        }

        Ok(Cached {
            value,
            cache_age: None,
        })
    }

    /// Cache failures degrade to a miss.
    async fn cache_get(&self, key: &str) -> Option<CacheEntry> {
        let cache = Arc::clone(&self.cache);
        let lookup = key.to_owned();
        match task::spawn_blocking(move || cache.get(&lookup)).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(err)) => {
                warn!("cache read {key} failed: {err:#}");
                None
            }
            Err(err) => {
                warn!("cache read {key} failed: {err}");
                None
            }
        }
    }

    async fn cache_put(&self, key: String, data: serde_json::Value) {
        let cache = Arc::clone(&self.cache);
        let ttl = self.cache_ttl;
        let write = task::spawn_blocking(move || cache.put(&key, data, ttl).map(|()| key)).await;
        match write {
            Ok(Ok(key)) => debug!("cached {key}"),
            Ok(Err(err)) => warn!("cache write failed: {err:#}"),
            Err(err) => warn!("cache write failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, NoopCache};
    use crate::transcripts::testing::seed;
    use crate::upstream::testing::FakeUpstream;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        _dir: TempDir,
        store: TranscriptStore,
        upstream: Arc<FakeUpstream>,
        cache: Arc<MemoryCache>,
        service: FetchService,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let store = TranscriptStore::open(dir.path().join("transcripts.db")).unwrap();
        let upstream = Arc::new(FakeUpstream::new());
        let cache = Arc::new(MemoryCache::new());
        let service = FetchService::new(
            store.clone(),
            upstream.clone(),
            cache.clone(),
            cache::DEFAULT_CACHE_TTL,
        );
        Harness {
            _dir: dir,
            store,
            upstream,
            cache,
            service,
        }
    }

    #[test]
    fn primary_language_is_first_entry() {
        assert_eq!(primary_language("es,en"), "es");
        assert_eq!(primary_language(" de , en"), "de");
        assert_eq!(primary_language(""), "en");
        assert_eq!(primary_language(",fr"), "fr");
    }

    #[test]
    fn languages_pass_through_verbatim() {
        assert_eq!(normalize_languages(""), "en");
        assert_eq!(normalize_languages("en,es"), "en,es");
        assert_eq!(normalize_languages(" en, es "), " en, es ");
    }

    #[tokio::test]
    async fn captions_keep_caller_spacing_in_key_and_request() {
        let h = harness();
        let result = h.service.captions("dQw4w9WgXcQ", " en,es").await.unwrap();
        assert_eq!(result.value.languages, " en,es");
        assert_eq!(*h.upstream.languages_seen.lock(), vec![" en,es".to_string()]);

        let again = h.service.captions("dQw4w9WgXcQ", " en,es").await.unwrap();
        assert!(again.is_cached());
        assert!(!h.service.captions("dQw4w9WgXcQ", "en,es").await.unwrap().is_cached());
    }

    #[tokio::test]
    async fn first_fetch_goes_upstream_and_persists() {
        let h = harness();
        let raw = "https://youtu.be/dQw4w9WgXcQ";
        let (transcript, source) = h.service.fetch_transcript(raw, "es,en", false).await.unwrap();

        assert_eq!(source, Source::Upstream);
        assert_eq!(transcript.video_id, "dQw4w9WgXcQ");
        assert_eq!(transcript.language, "es");
        assert_eq!(transcript.source_url, raw);
        assert_eq!(transcript.author, "Rick Astley");
        assert_eq!(transcript.fetch_count, 1);
        assert_eq!(transcript.timestamps.as_ref().map(Vec::len), Some(2));
        assert_eq!(h.upstream.calls(), 3);
        assert!(h.upstream.languages_seen.lock().iter().all(|l| l == "es,en"));

        let stored = h.store.find_by_video_id("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(stored, transcript);
    }

    #[tokio::test]
    async fn stored_transcript_short_circuits_upstream() {
        let h = harness();
        seed(&h.store, "dQw4w9WgXcQ", 3, "2024-01-01T00:00:00.000Z");

        let (transcript, source) = h
            .service
            .fetch_transcript("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "en", false)
            .await
            .unwrap();

        assert_eq!(source, Source::Database);
        assert_eq!(transcript.fetch_count, 4);
        assert_eq!(h.upstream.calls(), 0);
    }

    #[tokio::test]
    async fn force_refetches_and_accumulates_count() {
        let h = harness();
        h.service.fetch_transcript("dQw4w9WgXcQ", "en", false).await.unwrap();
        *h.upstream.captions.lock() = Ok("fresh captions".into());

        let (transcript, source) = h.service.fetch_transcript("dQw4w9WgXcQ", "en", true).await.unwrap();

        assert_eq!(source, Source::Upstream);
        assert_eq!(transcript.fetch_count, 2);
        assert_eq!(transcript.captions, "fresh captions");
        assert_eq!(h.upstream.calls(), 6);
    }

    #[tokio::test]
    async fn invalid_reference_does_no_io() {
        let h = harness();
        let err = h.service.fetch_transcript("invalid", "en", false).await.unwrap_err();

        assert!(matches!(err, FetchError::InvalidVideoReference(_)));
        assert!(err.to_string().contains("Invalid"));
        assert_eq!(h.upstream.calls(), 0);
        assert_eq!(h.store.list(10, 0).unwrap().1, 0);
    }

    #[tokio::test]
    async fn captions_failure_writes_nothing() {
        let h = harness();
        *h.upstream.captions.lock() = Err((404, "no captions".into()));

        let err = h.service.fetch_transcript("dQw4w9WgXcQ", "en", false).await.unwrap_err();

        match err {
            FetchError::Upstream(inner) => {
                assert_eq!(inner.status(), Some(404));
                assert_eq!(inner.to_string(), "Failed to fetch captions: 404 - no captions");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(h.store.find_by_video_id("dQw4w9WgXcQ").unwrap().is_none());
    }

    #[tokio::test]
    async fn metadata_failure_writes_nothing() {
        let h = harness();
        *h.upstream.metadata.lock() = Err((500, "boom".into()));

        let err = h.service.fetch_transcript("dQw4w9WgXcQ", "en", true).await.unwrap_err();

        assert!(matches!(err, FetchError::Upstream(ref inner) if inner.status() == Some(500)));
        assert!(h.store.find_by_video_id("dQw4w9WgXcQ").unwrap().is_none());
    }

    #[tokio::test]
    async fn timestamps_failure_degrades_to_none() {
        let h = harness();
        *h.upstream.timestamps.lock() = Err((404, "missing".into()));

        let (transcript, source) = h.service.fetch_transcript("dQw4w9WgXcQ", "en", false).await.unwrap();

        assert_eq!(source, Source::Upstream);
        assert!(transcript.timestamps.is_none());
        assert!(h.store.find_by_video_id("dQw4w9WgXcQ").unwrap().is_some());
    }

    #[tokio::test]
    async fn get_transcript_touches_and_reports_missing() {
        let h = harness();
        seed(&h.store, "dQw4w9WgXcQ", 5, "2024-01-01T00:00:00.000Z");

        assert_eq!(h.service.get_transcript("dQw4w9WgXcQ").await.unwrap().fetch_count, 6);
        assert!(matches!(
            h.service.get_transcript("nonexistent").await.unwrap_err(),
            FetchError::NotFound(_)
        ));
        assert!(matches!(
            h.service.get_transcript("https://youtu.be/dQw4w9WgXcQ").await.unwrap_err(),
            FetchError::InvalidVideoReference(_)
        ));
    }

    #[tokio::test]
    async fn metadata_is_cached_after_first_miss() {
        let h = harness();
        let first = h.service.metadata("dQw4w9WgXcQ").await.unwrap();
        assert!(!first.is_cached());
        assert_eq!(first.value.video_id, "dQw4w9WgXcQ");

        let second = h.service.metadata("https://youtu.be/dQw4w9WgXcQ").await.unwrap();
        assert!(second.is_cached());
        assert!(second.cache_age.unwrap() < 5);
        assert_eq!(second.value, first.value);
        assert_eq!(h.upstream.calls(), 1);
    }

    #[tokio::test]
    async fn disabled_cache_still_serves_from_upstream() {
        let dir = tempdir().unwrap();
        let store = TranscriptStore::open(dir.path().join("transcripts.db")).unwrap();
        let upstream = Arc::new(FakeUpstream::new());
        let service = FetchService::new(
            store,
            upstream.clone(),
            Arc::new(NoopCache),
            cache::DEFAULT_CACHE_TTL,
        );

        for _ in 0..2 {
            let captions = service.captions("dQw4w9WgXcQ", "en").await.unwrap();
            assert!(!captions.is_cached());
            assert_eq!(captions.value.captions, "We're no strangers to love");
        }
        assert_eq!(upstream.calls(), 2);
        assert!(service.clear_cache("dQw4w9WgXcQ").await.unwrap().is_empty());
        assert!(!service.cache_stats().enabled);
    }

    #[tokio::test]
    async fn upstream_failure_leaves_cache_untouched() {
        let h = harness();
        *h.upstream.metadata.lock() = Err((503, "busy".into()));

        let err = h.service.metadata("dQw4w9WgXcQ").await.unwrap_err();
        assert!(matches!(err, FetchError::UpstreamLookup(ref inner) if inner.status() == Some(503)));
        assert_eq!(err.to_string(), "Upstream API error: 503 - busy");
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn captions_are_cached_per_language_list() {
        let h = harness();
        h.service.captions("dQw4w9WgXcQ", "en").await.unwrap();
        let other = h.service.captions("dQw4w9WgXcQ", "en,es").await.unwrap();
        assert!(!other.is_cached());
        assert_eq!(other.value.languages, "en,es");

        let again = h.service.captions("dQw4w9WgXcQ", "en").await.unwrap();
        assert!(again.is_cached());
        assert_eq!(h.upstream.calls(), 2);
    }

    #[tokio::test]
    async fn clear_cache_drops_metadata_and_common_caption_keys() {
        let h = harness();
        h.service.metadata("dQw4w9WgXcQ").await.unwrap();
        h.service.captions("dQw4w9WgXcQ", "en").await.unwrap();
        assert_eq!(h.cache.len(), 2);

        let cleared = h.service.clear_cache("dQw4w9WgXcQ").await.unwrap();
        assert_eq!(cleared.len(), 1 + COMMON_CAPTION_LANGUAGES.len());
        assert!(cleared.contains(&"youtube:captions:dQw4w9WgXcQ:en".to_string()));
        assert!(h.cache.is_empty());

        assert!(matches!(
            h.service.clear_cache("bad").await.unwrap_err(),
            FetchError::InvalidVideoReference(_)
        ));
    }
}
