//! Content-addressed cache of synthesized audio.
//!
//! The key is a SHA-256 over `(text, language, voice profile, format)`, so
//! identical utterances synthesize once and every later broadcast serves the
//! cached object. Payloads are immutable once written; metadata lives under
//! a single mutex. Eviction binds on whichever cap is hit first: total
//! bytes, entry count, or idle age. A disk directory, when configured, holds
//! a flat mirror keyed by the same hash so the cache survives restarts.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use shared::{AudioMetadata, Language};

const AUDIO_KEY_LEN: usize = 64;

#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: Bytes,
    format: String,
    voice_profile: String,
    duration_secs: f32,
    created_at: Instant,
    last_access: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
}

/// A cache hit as handed to the router: the public URL plus the metadata the
/// translation frame carries.
#[derive(Debug, Clone)]
pub struct CachedAudio {
    pub key: String,
    pub url: String,
    pub metadata: AudioMetadata,
}

pub struct AudioCache {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
    max_entries: usize,
    idle_max: Duration,
    disk_dir: Option<PathBuf>,
    public_url: String,
}

impl AudioCache {
    pub async fn new(
        public_url: &str,
        max_bytes: u64,
        max_entries: usize,
        idle_max: Duration,
        disk_dir: Option<PathBuf>,
    ) -> std::io::Result<Self> {
        if let Some(dir) = &disk_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(Self {
            inner: Mutex::new(CacheInner::default()),
            max_bytes,
            max_entries: max_entries.max(1),
            idle_max,
            disk_dir,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }

    /// Deterministic content address for one synthesized utterance.
    pub fn key_for(text: &str, language: Language, voice_profile: &str, format: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0x1f]);
        hasher.update(language.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(voice_profile.as_bytes());
        hasher.update([0x1f]);
        hasher.update(format.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Reject anything that is not a bare content hash from our key space.
    /// This is the defense against path traversal on the HTTP surface.
    pub fn is_valid_key(key: &str) -> bool {
        key.len() == AUDIO_KEY_LEN
            && key
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }

    pub fn mime_for(format: &str) -> &'static str {
        match format {
            "mp3" => "audio/mpeg",
            "ogg" => "audio/ogg",
            "wav" => "audio/wav",
            _ => "application/octet-stream",
        }
    }

    fn url_for(&self, key: &str, format: &str) -> String {
        format!("{}/audio/{}.{}", self.public_url, key, format)
    }

    /// Fast hit check used before synthesis.
    pub fn lookup(
        &self,
        text: &str,
        language: Language,
        voice_profile: &str,
        format: &str,
    ) -> Option<CachedAudio> {
        let key = Self::key_for(text, language, voice_profile, format);
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(&key)?;
        entry.last_access = Instant::now();
        Some(CachedAudio {
            url: self.url_for(&key, &entry.format),
            metadata: AudioMetadata {
                format: entry.format.clone(),
                byte_size: entry.bytes.len(),
                duration_estimate_secs: entry.duration_secs,
                voice_profile: entry.voice_profile.clone(),
            },
            key,
        })
    }

    pub fn has(&self, text: &str, language: Language, voice_profile: &str, format: &str) -> bool {
        let key = Self::key_for(text, language, voice_profile, format);
        self.inner.lock().unwrap().entries.contains_key(&key)
    }

    /// Insert a freshly synthesized object and return its serving handle.
    /// Eviction runs opportunistically on every insert.
    pub async fn put(
        &self,
        text: &str,
        language: Language,
        voice_profile: &str,
        format: &str,
        bytes: Bytes,
        duration_secs: f32,
    ) -> CachedAudio {
        let key = Self::key_for(text, language, voice_profile, format);
        let now = Instant::now();
        let byte_size = bytes.len();

        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(existing) = inner.entries.get_mut(&key) {
                // Idempotent: the payload for a key never changes.
                existing.last_access = now;
            } else {
                inner.total_bytes += byte_size as u64;
                inner.entries.insert(
                    key.clone(),
                    CacheEntry {
                        bytes: bytes.clone(),
                        format: format.to_string(),
                        voice_profile: voice_profile.to_string(),
                        duration_secs,
                        created_at: now,
                        last_access: now,
                    },
                );
            }
            Self::evict_locked(&mut inner, self.max_bytes, self.max_entries, None)
        };
        self.remove_from_disk(&evicted).await;

        if let Some(dir) = &self.disk_dir {
            let path = dir.join(format!("{}.{}", key, format));
            if let Err(e) = tokio::fs::write(&path, &bytes).await {
                warn!("audio cache disk write failed for {}: {}", path.display(), e);
            }
        }

        CachedAudio {
            url: self.url_for(&key, format),
            metadata: AudioMetadata {
                format: format.to_string(),
                byte_size,
                duration_estimate_secs: duration_secs,
                voice_profile: voice_profile.to_string(),
            },
            key,
        }
    }

    /// Fetch bytes for HTTP serving. Falls back to the disk mirror on a
    /// memory miss so restarts do not 404 recently synthesized audio.
    pub async fn get(&self, key: &str) -> Option<(Bytes, String)> {
        if !Self::is_valid_key(key) {
            return None;
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.last_access = Instant::now();
                return Some((entry.bytes.clone(), entry.format.clone()));
            }
        }

        let dir = self.disk_dir.as_ref()?;
        for format in ["mp3", "ogg", "wav"] {
            let path = dir.join(format!("{}.{}", key, format));
            if let Ok(data) = tokio::fs::read(&path).await {
                debug!("audio cache disk hit for {}", key);
                let bytes = Bytes::from(data);
                let now = Instant::now();
                let evicted = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.total_bytes += bytes.len() as u64;
                    inner.entries.insert(
                        key.to_string(),
                        CacheEntry {
                            bytes: bytes.clone(),
                            format: format.to_string(),
                            voice_profile: String::new(),
                            duration_secs: 0.0,
                            created_at: now,
                            last_access: now,
                        },
                    );
                    Self::evict_locked(&mut inner, self.max_bytes, self.max_entries, Some(key))
                };
                self.remove_from_disk(&evicted).await;
                return Some((bytes, format.to_string()));
            }
        }
        None
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().unwrap().total_bytes
    }

    /// Low-frequency sweep: drop idle entries, then re-apply the caps.
    pub async fn sweep(&self) {
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            let idle: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_access) > self.idle_max)
                .map(|(k, _)| k.clone())
                .collect();
            let mut evicted = Vec::new();
            for key in idle {
                if let Some(entry) = inner.entries.remove(&key) {
                    inner.total_bytes -= entry.bytes.len() as u64;
                    evicted.push((key, entry.format));
                }
            }
            evicted.extend(Self::evict_locked(
                &mut inner,
                self.max_bytes,
                self.max_entries,
                None,
            ));
            evicted
        };
        if !evicted.is_empty() {
            debug!("audio cache sweep evicted {} entries", evicted.len());
        }
        self.remove_from_disk(&evicted).await;
    }

    /// Evict least-recently-used entries until both caps hold. `keep` pins a
    /// key that must survive this round (the one just inserted).
    fn evict_locked(
        inner: &mut CacheInner,
        max_bytes: u64,
        max_entries: usize,
        keep: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut evicted = Vec::new();
        while inner.entries.len() > max_entries || inner.total_bytes > max_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, _)| keep != Some(k.as_str()))
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            let Some(key) = victim else { break };
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes -= entry.bytes.len() as u64;
                let age = entry.created_at.elapsed();
                debug!("evicting audio object {} (age {:?})", key, age);
                evicted.push((key, entry.format));
            }
        }
        evicted
    }

    async fn remove_from_disk(&self, evicted: &[(String, String)]) {
        let Some(dir) = &self.disk_dir else { return };
        for (key, format) in evicted {
            let _ = tokio::fs::remove_file(dir.join(format!("{}.{}", key, format))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache(max_bytes: u64, max_entries: usize) -> AudioCache {
        AudioCache::new(
            "http://localhost:3001",
            max_bytes,
            max_entries,
            Duration::from_secs(3600),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_lookup_is_a_hit() {
        let cache = cache(1 << 20, 100).await;
        let stored = cache
            .put("Bienvenidos", Language::Es, "Lupe", "mp3", Bytes::from_static(b"AUDIO"), 1.2)
            .await;

        assert!(stored.url.starts_with("http://localhost:3001/audio/"));
        assert!(stored.url.ends_with(".mp3"));
        assert!(AudioCache::is_valid_key(&stored.key));

        let hit = cache.lookup("Bienvenidos", Language::Es, "Lupe", "mp3").unwrap();
        assert_eq!(hit.url, stored.url);
        assert_eq!(hit.metadata.byte_size, 5);

        // Different voice, different object.
        assert!(cache.lookup("Bienvenidos", Language::Es, "Conchita", "mp3").is_none());
        assert!(!cache.has("Bienvenidos", Language::En, "Lupe", "mp3"));
    }

    #[tokio::test]
    async fn test_key_is_deterministic_and_safe() {
        let a = AudioCache::key_for("hello", Language::En, "Joanna", "mp3");
        let b = AudioCache::key_for("hello", Language::En, "Joanna", "mp3");
        assert_eq!(a, b);
        assert!(AudioCache::is_valid_key(&a));

        // Near-miss inputs produce distinct keys (separator matters).
        let c = AudioCache::key_for("helloen", Language::En, "Joanna", "mp3");
        assert_ne!(a, c);

        for bad in ["", "abc", "../../../etc/passwd", &"Z".repeat(64), &a[..63]] {
            assert!(!AudioCache::is_valid_key(bad), "accepted {:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_entry_cap_evicts_lru() {
        let cache = cache(1 << 20, 2).await;
        cache.put("one", Language::En, "Joanna", "mp3", Bytes::from_static(b"1"), 0.1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.put("two", Language::En, "Joanna", "mp3", Bytes::from_static(b"2"), 0.1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch "one" so "two" becomes the LRU victim.
        assert!(cache.lookup("one", Language::En, "Joanna", "mp3").is_some());
        cache.put("three", Language::En, "Joanna", "mp3", Bytes::from_static(b"3"), 0.1).await;

        assert_eq!(cache.entry_count(), 2);
        assert!(cache.has("one", Language::En, "Joanna", "mp3"));
        assert!(!cache.has("two", Language::En, "Joanna", "mp3"));
        assert!(cache.has("three", Language::En, "Joanna", "mp3"));
    }

    #[tokio::test]
    async fn test_byte_cap_binds() {
        let cache = cache(10, 100).await;
        cache.put("a", Language::En, "Joanna", "mp3", Bytes::from(vec![0u8; 6]), 0.1).await;
        cache.put("b", Language::En, "Joanna", "mp3", Bytes::from(vec![0u8; 6]), 0.1).await;
        assert!(cache.total_bytes() <= 10);
        assert_eq!(cache.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_sweep() {
        let cache = AudioCache::new(
            "http://localhost:3001",
            1 << 20,
            100,
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap();

        cache.put("a", Language::En, "Joanna", "mp3", Bytes::from_static(b"X"), 0.1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.sweep().await;
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_disk_mirror_survives_memory_loss() {
        let dir = tempfile::tempdir().unwrap();
        let stored_key;
        {
            let cache = AudioCache::new(
                "http://localhost:3001",
                1 << 20,
                100,
                Duration::from_secs(3600),
                Some(dir.path().to_path_buf()),
            )
            .await
            .unwrap();
            let stored = cache
                .put("persisted", Language::En, "Joanna", "mp3", Bytes::from_static(b"DATA"), 0.2)
                .await;
            stored_key = stored.key;
        }

        // Fresh cache instance with an empty memory map, same disk dir.
        let cache = AudioCache::new(
            "http://localhost:3001",
            1 << 20,
            100,
            Duration::from_secs(3600),
            Some(dir.path().to_path_buf()),
        )
        .await
        .unwrap();
        let (bytes, format) = cache.get(&stored_key).await.unwrap();
        assert_eq!(&bytes[..], b"DATA");
        assert_eq!(format, "mp3");
    }

    #[tokio::test]
    async fn test_get_rejects_invalid_keys() {
        let cache = cache(1 << 20, 100).await;
        assert!(cache.get("../../secret").await.is_none());
        assert!(cache.get("0123").await.is_none());
    }
}
